use log::trace;

use crate::resource_limit::{LimitableResource, ResourceLimit};

/// Two-phase charge against a [`ResourceLimit`].
///
/// The amount is charged when the reservation is created. Dropping the
/// reservation without [`commit`](Self::commit) returns the charge to the
/// ledger, which gives every early-return path of an initialization a
/// guaranteed rollback.
#[derive(Debug)]
pub struct ScopedReservation<'a> {
    limit: &'a ResourceLimit,
    which: LimitableResource,
    amount: u64,
    committed: bool,
}

impl<'a> ScopedReservation<'a> {
    pub(crate) fn new(limit: &'a ResourceLimit, which: LimitableResource, amount: u64) -> Self {
        Self {
            limit,
            which,
            amount,
            committed: false,
        }
    }

    /// The reserved amount.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Makes the charge permanent.
    ///
    /// From here on the amount has to be returned with an explicit
    /// [`ResourceLimit::release`].
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ScopedReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            trace!(
                "cancelling uncommitted reservation of {} bytes of {}",
                self.amount,
                self.which.name()
            );
            self.limit.release(self.which, self.amount);
        }
    }
}
