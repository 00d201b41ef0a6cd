use core::alloc::Layout;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

use log::trace;

use crate::dynamic_page_manager::{DynamicPageManager, PageHandle};
use crate::error::{KernelError, Result};

/// Handle to one live slot of a [`SlabHeap`].
///
/// The generation changes whenever the slot is recycled, so a stale handle
/// (double free, use after free) is detected instead of silently aliasing
/// the slot's next owner.
pub struct SlabHandle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlabHandle<T> {
    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for SlabHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlabHandle<T> {}

impl<T> PartialEq for SlabHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for SlabHandle<T> {}

impl<T> Hash for SlabHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for SlabHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// Fixed-capacity pool of typed slots backed by pages drawn from a
/// [`DynamicPageManager`].
///
/// Capacity is fixed at construction and never grows; freed slots are
/// recycled through a free list.
#[derive(Debug)]
pub struct SlabHeap<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    pages: Vec<PageHandle>,
    slots_per_page: usize,
    used: usize,
}

impl<T> SlabHeap<T> {
    /// Draws `num_pages` pages from `page_manager` and carves them into
    /// slots of `slot_layout` size.
    ///
    /// If the page manager runs dry on the way, every page drawn so far is
    /// returned before the error propagates.
    pub fn new(
        page_manager: &mut DynamicPageManager,
        num_pages: usize,
        slot_layout: Layout,
    ) -> Result<Self> {
        let slot_size = slot_layout.pad_to_align().size().max(1);
        assert!(
            slot_size <= page_manager.page_size(),
            "slot does not fit into one page"
        );

        let mut pages = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            match page_manager.allocate() {
                Ok(page) => pages.push(page),
                Err(err) => {
                    for page in pages.drain(..) {
                        page_manager.free(page);
                    }
                    return Err(err);
                }
            }
        }

        let slots_per_page = page_manager.page_size() / slot_size;
        let capacity = pages.len() * slots_per_page;

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                value: None,
                generation: 0,
            });
        }

        trace!(
            "slab heap with {} slots of {} bytes over {} pages",
            capacity,
            slot_size,
            pages.len()
        );

        Ok(Self {
            slots,
            // Reversed so allocation starts at slot 0.
            free_list: (0..capacity as u32).rev().collect(),
            pages,
            slots_per_page,
            used: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Backing page of slot `index`.
    pub fn page_for_slot(&self, index: usize) -> PageHandle {
        assert!(index < self.slots.len(), "slot index out of range");
        self.pages[index / self.slots_per_page]
    }

    /// Claims a free slot and stores `value` in it.
    ///
    /// Fails with `OutOfMemory` once every slot is live.
    pub fn allocate(&mut self, value: T) -> Result<SlabHandle<T>> {
        let index = self.free_list.pop().ok_or(KernelError::OutOfMemory)?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.value.is_none());

        slot.value = Some(value);
        self.used += 1;

        Ok(SlabHandle {
            index,
            generation: slot.generation,
            _marker: PhantomData,
        })
    }

    /// Returns the slot behind `handle` to the pool and hands back the
    /// stored value.
    ///
    /// A stale handle means the slot was already freed and possibly
    /// reassigned: that is a double free and aborts.
    pub fn free(&mut self, handle: SlabHandle<T>) -> T {
        let slot = &mut self.slots[handle.index as usize];
        assert!(
            slot.generation == handle.generation,
            "stale slab handle for slot {} (double free?)",
            handle.index
        );
        let Some(value) = slot.value.take() else {
            panic!("stale slab handle for slot {} (double free?)", handle.index);
        };

        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.used -= 1;
        value
    }

    pub fn get(&self, handle: SlabHandle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: SlabHandle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::SecureAddress;

    const PAGE: usize = 0x1000;

    fn page_manager(pages: usize) -> DynamicPageManager {
        DynamicPageManager::new(SecureAddress::from_u64(0x8000_0000), 0, pages * PAGE, PAGE)
    }

    fn u64_heap(manager: &mut DynamicPageManager, pages: usize) -> SlabHeap<u64> {
        SlabHeap::new(manager, pages, Layout::new::<u64>()).unwrap()
    }

    #[test]
    fn test_capacity_derives_from_pages() {
        let mut manager = page_manager(4);
        let heap = u64_heap(&mut manager, 2);

        assert_eq!(heap.capacity(), 2 * PAGE / 8);
        assert_eq!(heap.used(), 0);
        assert_eq!(manager.used_page_count(), 2);
    }

    #[test]
    fn test_page_sized_slots() {
        let mut manager = page_manager(4);
        let layout = Layout::from_size_align(PAGE, PAGE).unwrap();
        let heap = SlabHeap::<()>::new(&mut manager, 3, layout).unwrap();

        assert_eq!(heap.capacity(), 3);
        assert_eq!(heap.page_for_slot(0), heap.page_for_slot(0));
        assert_ne!(heap.page_for_slot(0), heap.page_for_slot(2));
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut manager = page_manager(1);
        let mut heap = u64_heap(&mut manager, 1);

        for i in 0..heap.capacity() {
            heap.allocate(i as u64).unwrap();
        }
        assert_eq!(heap.allocate(0).unwrap_err(), KernelError::OutOfMemory);
        assert_eq!(heap.used(), heap.capacity());
    }

    #[test]
    fn test_free_recycles_slot_with_new_generation() {
        let mut manager = page_manager(1);
        let mut heap = u64_heap(&mut manager, 1);

        let first = heap.allocate(7).unwrap();
        assert_eq!(heap.free(first), 7);
        assert_eq!(heap.used(), 0);

        let second = heap.allocate(9).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);

        // The stale handle no longer resolves.
        assert_eq!(heap.get(first), None);
        assert_eq!(heap.get(second), Some(&9));

        heap.free(second);
    }

    #[test]
    fn test_get_mut_updates_value() {
        let mut manager = page_manager(1);
        let mut heap = u64_heap(&mut manager, 1);

        let handle = heap.allocate(1).unwrap();
        *heap.get_mut(handle).unwrap() = 5;
        assert_eq!(heap.free(handle), 5);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_aborts() {
        let mut manager = page_manager(1);
        let mut heap = u64_heap(&mut manager, 1);

        let handle = heap.allocate(1).unwrap();
        heap.free(handle);
        heap.free(handle);
    }

    #[test]
    fn test_failed_construction_returns_pages() {
        let mut manager = page_manager(2);

        assert_eq!(
            SlabHeap::<u64>::new(&mut manager, 3, Layout::new::<u64>()).unwrap_err(),
            KernelError::OutOfMemory
        );
        assert_eq!(manager.used_page_count(), 0);

        // The pages are all still usable.
        let heap = u64_heap(&mut manager, 2);
        assert_eq!(heap.capacity(), 2 * PAGE / 8);
    }
}
