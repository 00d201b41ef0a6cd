mod dummy;
mod emulated;

pub use dummy::DummySecureMemoryModule;
pub use emulated::{EmulatedSecureMemoryModule, SECURE_MEMORY_BASE};

use crate::address::{PhysicalAddress, SecureAddress};
use crate::error::Result;
use crate::util::align_up;
use crate::PAGE_SIZE;

/// Platform memory region a secure allocation is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Application,
    Applet,
    System,
    SystemNonSecure,
}

pub(crate) const POOL_COUNT: usize = 4;

impl Pool {
    pub fn name(&self) -> &'static str {
        match self {
            Pool::Application => "application",
            Pool::Applet => "applet",
            Pool::System => "system",
            Pool::SystemNonSecure => "system non-secure",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Platform bookkeeping charged on top of the aligned size for the
/// user-facing pools.
pub const SECURE_OVERHEAD_SIZE: usize = PAGE_SIZE;

/// How much platform memory a secure allocation of `size` bytes from
/// `pool` really needs.
///
/// Pure and deterministic, monotonic non-decreasing in `size`. Both the
/// resource-limit reservation and the platform backing derive from this
/// one function, so the two can never disagree.
pub fn calculate_required_secure_memory_size(size: usize, pool: Pool) -> usize {
    match pool {
        Pool::Application | Pool::Applet => align_up(size, PAGE_SIZE) + SECURE_OVERHEAD_SIZE,
        Pool::System | Pool::SystemNonSecure => align_up(size, PAGE_SIZE),
    }
}

/// A module that provides secure memory regions from the emulated
/// platform.
pub trait SecureMemoryModule {
    /// Carves a new secure region of `size` bytes out of `pool`.
    fn allocate_secure_memory(&self, size: usize, pool: Pool) -> Result<SecureAddress>;

    /// Returns a region to the platform.
    ///
    /// Has to be called with exactly the size and pool of the matching
    /// allocation.
    fn free_secure_memory(&self, address: SecureAddress, size: usize, pool: Pool);

    /// Translates `address` into a dereferenceable physical address.
    fn physical_address(&self, address: SecureAddress) -> Result<PhysicalAddress>;

    /// Sizing query usable before committing to an allocation.
    fn calculate_required_secure_memory_size(&self, size: usize, pool: Pool) -> usize {
        calculate_required_secure_memory_size(size, pool)
    }
}
