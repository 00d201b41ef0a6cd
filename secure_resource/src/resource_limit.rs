use core::array;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::trace;

use crate::error::{KernelError, Result};
use crate::scoped_reservation::ScopedReservation;

/// Resource kinds accounted by a [`ResourceLimit`] ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitableResource {
    PhysicalMemory,
    Threads,
    Events,
    TransferMemory,
    Sessions,
}

pub(crate) const LIMITABLE_RESOURCE_COUNT: usize = 5;

impl LimitableResource {
    pub fn name(&self) -> &'static str {
        match self {
            LimitableResource::PhysicalMemory => "physical memory",
            LimitableResource::Threads => "threads",
            LimitableResource::Events => "events",
            LimitableResource::TransferMemory => "transfer memory",
            LimitableResource::Sessions => "sessions",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Accounting ledger bounding how much of each resource kind may be
/// committed against it.
///
/// All operations are atomic with respect to concurrent callers sharing
/// the same limit: reservations go through a compare-exchange loop, so
/// `used <= limit` holds for every kind at every instant.
#[derive(Debug)]
pub struct ResourceLimit {
    limits: [AtomicU64; LIMITABLE_RESOURCE_COUNT],
    used: [AtomicU64; LIMITABLE_RESOURCE_COUNT],
    peaks: [AtomicU64; LIMITABLE_RESOURCE_COUNT],

    /// Balanced open/close reference count on this limit's lifetime.
    ref_count: AtomicUsize,
}

impl ResourceLimit {
    pub fn new() -> Self {
        Self {
            limits: array::from_fn(|_| AtomicU64::new(0)),
            used: array::from_fn(|_| AtomicU64::new(0)),
            peaks: array::from_fn(|_| AtomicU64::new(0)),
            ref_count: AtomicUsize::new(0),
        }
    }

    /// Sets the upper bound for `which`.
    ///
    /// Fails with `LimitReached` if the new bound is below what is
    /// currently in use.
    pub fn set_limit_value(&self, which: LimitableResource, value: u64) -> Result<()> {
        if value < self.used[which.index()].load(Ordering::Acquire) {
            return Err(KernelError::LimitReached);
        }
        self.limits[which.index()].store(value, Ordering::Release);
        Ok(())
    }

    pub fn limit_value(&self, which: LimitableResource) -> u64 {
        self.limits[which.index()].load(Ordering::Acquire)
    }

    pub fn current_value(&self, which: LimitableResource) -> u64 {
        self.used[which.index()].load(Ordering::Acquire)
    }

    pub fn peak_value(&self, which: LimitableResource) -> u64 {
        self.peaks[which.index()].load(Ordering::Acquire)
    }

    pub fn free_value(&self, which: LimitableResource) -> u64 {
        let limit = self.limit_value(which);
        limit.saturating_sub(self.current_value(which))
    }

    /// How many open references are currently held on this limit.
    pub fn open_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Reserves `amount` of `which`.
    ///
    /// The returned reservation releases the charge when dropped unless it
    /// is committed first, so every early-return path of a caller rolls
    /// back automatically.
    pub fn reserve(&self, which: LimitableResource, amount: u64) -> Result<ScopedReservation<'_>> {
        self.try_charge(which, amount)?;
        trace!("reserved {} bytes of {}", amount, which.name());
        Ok(ScopedReservation::new(self, which, amount))
    }

    fn try_charge(&self, which: LimitableResource, amount: u64) -> Result<()> {
        let used = &self.used[which.index()];

        loop {
            let current = used.load(Ordering::Acquire);
            let limit = self.limits[which.index()].load(Ordering::Acquire);

            let new_used = match current.checked_add(amount) {
                Some(value) => value,
                None => return Err(KernelError::LimitReached),
            };
            if new_used > limit {
                return Err(KernelError::LimitReached);
            }

            match used.compare_exchange_weak(
                current,
                new_used,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }

        self.update_peak(which);
        Ok(())
    }

    fn update_peak(&self, which: LimitableResource) {
        let used = self.used[which.index()].load(Ordering::Acquire);
        let peak = &self.peaks[which.index()];

        loop {
            let current = peak.load(Ordering::Acquire);
            if used <= current {
                break;
            }
            match peak.compare_exchange_weak(current, used, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
    }

    /// Returns `amount` of `which` to the ledger.
    ///
    /// Releasing more than is currently in use is an accounting defect and
    /// aborts.
    pub fn release(&self, which: LimitableResource, amount: u64) {
        let used = &self.used[which.index()];

        loop {
            let current = used.load(Ordering::Acquire);
            assert!(
                current >= amount,
                "released more {} than was reserved",
                which.name()
            );
            match used.compare_exchange_weak(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }

        trace!("released {} bytes of {}", amount, which.name());
    }

    /// Takes an open reference on this limit.
    pub fn open(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops an open reference.
    ///
    /// Closing a limit that has no open references is an accounting defect
    /// and aborts.
    pub fn close(&self) {
        loop {
            let current = self.ref_count.load(Ordering::Acquire);
            assert!(current != 0, "unbalanced close on resource limit");
            if self
                .ref_count
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self::new()
    }
}
