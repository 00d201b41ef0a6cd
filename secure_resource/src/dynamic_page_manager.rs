use log::trace;

use crate::address::SecureAddress;
use crate::error::{KernelError, Result};
use crate::util::{div_ceil, is_aligned};

/// Arena index of one page of the secure region.
///
/// Handles are region-global page numbers; the raw address behind one only
/// exists for diagnostics via [`DynamicPageManager::address_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    index: usize,
}

impl PageHandle {
    pub(crate) const fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

type BitWord = u64;
const BITS_PER_WORD: usize = BitWord::BITS as usize;

/// Hands out fixed-size pages from one contiguous sub-range of the secure
/// region until exhausted.
///
/// The manager borrows its range from the owning resource; it never frees
/// the range itself, only recycles pages inside it.
pub struct DynamicPageManager {
    base: SecureAddress,
    size: usize,
    page_size: usize,

    /// Page number of `base` inside the whole region, so handles stay
    /// region-global.
    first_page: usize,

    /// One bit per page, set while the page is handed out.
    bitmap: Vec<BitWord>,
    used_pages: usize,
}

impl DynamicPageManager {
    /// Manages `[base, base + size)`, truncated to whole pages. `base` is
    /// page number `first_page` of the surrounding region.
    pub fn new(base: SecureAddress, first_page: usize, size: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size has to be a power of two");
        debug_assert!(is_aligned(base.as_u64() as usize, page_size));

        let page_count = size / page_size;
        Self {
            base,
            size: page_count * page_size,
            page_size,
            first_page,
            bitmap: vec![0; div_ceil(page_count, BITS_PER_WORD)],
            used_pages: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.size / self.page_size
    }

    pub fn used_page_count(&self) -> usize {
        self.used_pages
    }

    pub fn free_page_count(&self) -> usize {
        self.page_count() - self.used_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Emulated address of the page behind `handle`.
    pub fn address_of(&self, handle: PageHandle) -> SecureAddress {
        let local = self.local_index(handle);
        self.base.offset(local * self.page_size)
    }

    fn local_index(&self, handle: PageHandle) -> usize {
        assert!(
            handle.index >= self.first_page && handle.index - self.first_page < self.page_count(),
            "page handle outside the managed region"
        );
        handle.index - self.first_page
    }

    /// Claims one free page.
    ///
    /// Fails with `OutOfMemory` once the range is exhausted; nothing is
    /// modified in that case.
    pub fn allocate(&mut self) -> Result<PageHandle> {
        let page_count = self.page_count();

        for word_index in 0..self.bitmap.len() {
            let word = self.bitmap[word_index];
            if word == BitWord::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            let local = word_index * BITS_PER_WORD + bit;
            if local >= page_count {
                break;
            }

            self.bitmap[word_index] |= 1 << bit;
            self.used_pages += 1;

            let handle = PageHandle::new(self.first_page + local);
            trace!(
                "page {} allocated ({} left)",
                handle.index,
                self.free_page_count()
            );
            return Ok(handle);
        }

        Err(KernelError::OutOfMemory)
    }

    /// Returns a page to the pool.
    ///
    /// Freeing a page that is not currently handed out is an accounting
    /// defect and aborts.
    pub fn free(&mut self, handle: PageHandle) {
        let local = self.local_index(handle);
        let word = &mut self.bitmap[local / BITS_PER_WORD];
        let mask = 1 << (local % BITS_PER_WORD);

        assert!(*word & mask != 0, "page {} freed twice", handle.index);
        *word &= !mask;
        self.used_pages -= 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager(pages: usize) -> DynamicPageManager {
        DynamicPageManager::new(SecureAddress::from_u64(0x8000_0000), 1, pages * 0x1000, 0x1000)
    }

    #[test]
    fn test_pages_stay_inside_the_region() {
        let mut manager = manager(8);
        let base = 0x8000_0000u64;

        for _ in 0..8 {
            let page = manager.allocate().unwrap();
            let address = manager.address_of(page).as_u64();
            assert!(address >= base && address + 0x1000 <= base + 8 * 0x1000);
        }
    }

    #[test]
    fn test_exhaustion_fails_cleanly() {
        let mut manager = manager(3);

        for _ in 0..3 {
            manager.allocate().unwrap();
        }
        assert_eq!(manager.allocate().unwrap_err(), KernelError::OutOfMemory);
        assert_eq!(manager.used_page_count(), 3);
        assert_eq!(manager.free_page_count(), 0);
    }

    #[test]
    fn test_freed_pages_are_recycled() {
        let mut manager = manager(2);

        let first = manager.allocate().unwrap();
        let second = manager.allocate().unwrap();
        assert!(manager.allocate().is_err());

        manager.free(first);
        let again = manager.allocate().unwrap();
        assert_eq!(again, first);

        manager.free(second);
        manager.free(again);
        assert_eq!(manager.free_page_count(), 2);
    }

    #[test]
    fn test_handles_are_region_global() {
        let mut manager = manager(4);
        let page = manager.allocate().unwrap();

        // first_page is 1, so the first handle is page number 1.
        assert_eq!(page.index(), 1);
    }

    #[test]
    fn test_size_is_truncated_to_whole_pages() {
        let manager =
            DynamicPageManager::new(SecureAddress::from_u64(0x8000_0000), 0, 0x1000 + 17, 0x1000);
        assert_eq!(manager.page_count(), 1);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_aborts() {
        let mut manager = manager(2);
        let page = manager.allocate().unwrap();
        manager.free(page);
        manager.free(page);
    }

    #[test]
    #[should_panic(expected = "outside the managed region")]
    fn test_foreign_handle_aborts() {
        let manager = manager(2);
        manager.address_of(PageHandle::new(0));
    }
}
