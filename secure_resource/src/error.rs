use thiserror::Error;

/// Recoverable error codes surfaced by the secure resource subsystem.
///
/// Invariant violations (double free, unbalanced open/close, outstanding
/// allocations at finalize) are not represented here: they indicate a
/// defect in the caller and abort instead of returning a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The requested reservation exceeds the resource limit's free capacity.
    #[error("resource limit reached")]
    LimitReached,

    /// A page or slab pool is exhausted, or a region is too small to host
    /// its own bookkeeping.
    #[error("out of memory")]
    OutOfMemory,

    /// Physical address translation failed because the address is not part
    /// of any live secure region.
    #[error("invalid address")]
    InvalidAddress,
}

pub type Result<T> = core::result::Result<T, KernelError>;
