use core::mem::size_of;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::dynamic_page_manager::PageHandle;
use crate::util::div_ceil;

/// Reference count record kept per physical page backing the page-table
/// heap.
pub type RefCount = u16;

/// Per-page reference counters covering the whole secure region.
///
/// A count never goes negative: closing a page that has no open references
/// is an accounting defect and aborts. Pages may only be recycled once
/// their count is back to zero; that rule is enforced by the owning
/// manager.
pub struct RefCountTable {
    counts: Vec<AtomicU16>,
}

impl RefCountTable {
    /// Bytes needed to store one [`RefCount`] per page of a region of
    /// `resource_size` bytes.
    ///
    /// Callers round this up to page granularity before carving the table
    /// out of the region itself.
    pub fn calculate_size(resource_size: usize, page_size: usize) -> usize {
        div_ceil(resource_size, page_size) * size_of::<RefCount>()
    }

    pub fn new(page_count: usize) -> Self {
        Self {
            counts: (0..page_count).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.counts.len()
    }

    pub fn count(&self, page: PageHandle) -> RefCount {
        self.counts[page.index()].load(Ordering::Acquire)
    }

    /// Adds one reference to `page`.
    pub fn open(&self, page: PageHandle) {
        let previous = self.counts[page.index()].fetch_add(1, Ordering::AcqRel);
        assert!(
            previous < RefCount::MAX,
            "page {} reference count overflow",
            page.index()
        );
    }

    /// Drops one reference from `page`.
    pub fn close(&self, page: PageHandle) {
        let count = &self.counts[page.index()];

        loop {
            let current = count.load(Ordering::Acquire);
            assert!(
                current > 0,
                "page {} reference count underflow",
                page.index()
            );
            if count
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_calculate_size_covers_every_page() {
        assert_eq!(RefCountTable::calculate_size(0x1000, 0x1000), 2);
        assert_eq!(RefCountTable::calculate_size(0x1001, 0x1000), 4);
        assert_eq!(
            RefCountTable::calculate_size(1024 * 1024, 0x1000),
            256 * size_of::<RefCount>()
        );
    }

    #[test]
    fn test_open_close_roundtrip() {
        let table = RefCountTable::new(4);
        let page = PageHandle::new(2);

        table.open(page);
        table.open(page);
        assert_eq!(table.count(page), 2);

        table.close(page);
        table.close(page);
        assert_eq!(table.count(page), 0);
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_close_without_open_aborts() {
        let table = RefCountTable::new(4);
        table.close(PageHandle::new(0));
    }
}
