use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::address::PhysicalAddress;
use crate::dynamic_page_manager::PageHandle;
use crate::error::Result;
use crate::memory_block::{BlockInfo, MemoryBlock, PageTablePage};
use crate::ref_count_table::{RefCount, RefCountTable};
use crate::slab_heap::{SlabHandle, SlabHeap};

/// Synchronized façade over one [`SlabHeap`].
///
/// Allocate and free are serialized behind a mutex; the used count is
/// mirrored into an atomic so readers never take the lock.
pub struct SlabManager<T> {
    heap: Mutex<SlabHeap<T>>,
    used: AtomicUsize,
    capacity: usize,
}

impl<T> SlabManager<T> {
    pub fn new(heap: SlabHeap<T>) -> Self {
        assert!(heap.used() == 0, "manager over a heap with live slots");
        let capacity = heap.capacity();
        Self {
            heap: Mutex::new(heap),
            used: AtomicUsize::new(0),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlabHeap<T>> {
        self.heap.lock().expect("slab heap lock poisoned")
    }

    /// Claims a slot for `value`.
    ///
    /// Fails with `OutOfMemory` once every slot is live; concurrent
    /// callers never receive the same slot.
    pub fn allocate(&self, value: T) -> Result<SlabHandle<T>> {
        let mut heap = self.lock();
        let handle = heap.allocate(value)?;
        self.used.store(heap.used(), Ordering::Release);
        Ok(handle)
    }

    /// Frees the slot behind `handle` and returns its value.
    pub fn free(&self, handle: SlabHandle<T>) -> T {
        let mut heap = self.lock();
        let value = heap.free(handle);
        self.used.store(heap.used(), Ordering::Release);
        value
    }

    /// Live allocations right now.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Runs `f` on the slot behind `handle` while the heap lock is held.
    ///
    /// Returns `None` for a stale handle.
    pub fn with_slot<R>(&self, handle: SlabHandle<T>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let heap = self.lock();
        heap.get(handle).map(f)
    }

    pub fn with_slot_mut<R>(
        &self,
        handle: SlabHandle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut heap = self.lock();
        heap.get_mut(handle).map(f)
    }
}

/// Manager backing memory-block descriptors.
pub type MemoryBlockSlabManager = SlabManager<MemoryBlock>;

/// Manager backing block-information records.
pub type BlockInfoManager = SlabManager<BlockInfo>;

/// Backing allocator for page-table pages.
///
/// On top of the plain slab discipline it tracks one reference count per
/// backing page; a slot can only be freed once its page count is back at
/// zero.
pub struct PageTableManager {
    slots: SlabManager<PageTablePage>,
    ref_counts: RefCountTable,

    /// Translated base of the reference-count table, kept for diagnostics.
    table_address: PhysicalAddress,

    /// Slot index to backing page, fixed at construction. Page-table slots
    /// are page sized, so the mapping is one to one.
    slot_pages: Vec<PageHandle>,
}

impl PageTableManager {
    pub fn new(
        heap: SlabHeap<PageTablePage>,
        ref_counts: RefCountTable,
        table_address: PhysicalAddress,
    ) -> Self {
        let slot_pages = (0..heap.capacity()).map(|i| heap.page_for_slot(i)).collect();
        Self {
            slots: SlabManager::new(heap),
            ref_counts,
            table_address,
            slot_pages,
        }
    }

    /// Claims one page-table page.
    pub fn allocate(&self) -> Result<SlabHandle<PageTablePage>> {
        self.slots.allocate(PageTablePage)
    }

    /// Frees a page-table slot.
    ///
    /// The backing page must have no open references left; freeing a
    /// still-referenced page would corrupt the mapping machinery above and
    /// aborts instead.
    pub fn free(&self, handle: SlabHandle<PageTablePage>) {
        let page = self.backing_page(handle);
        assert!(
            self.ref_counts.count(page) == 0,
            "page-table page {} freed with open references",
            page.index()
        );
        self.slots.free(handle);
    }

    /// Adds one reference to the page backing `handle`.
    pub fn open_page(&self, handle: SlabHandle<PageTablePage>) {
        self.ref_counts.open(self.backing_page(handle));
    }

    /// Drops one reference from the page backing `handle`.
    pub fn close_page(&self, handle: SlabHandle<PageTablePage>) {
        self.ref_counts.close(self.backing_page(handle));
    }

    pub fn page_ref_count(&self, handle: SlabHandle<PageTablePage>) -> RefCount {
        self.ref_counts.count(self.backing_page(handle))
    }

    pub fn used(&self) -> usize {
        self.slots.used()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn table_address(&self) -> PhysicalAddress {
        self.table_address
    }

    fn backing_page(&self, handle: SlabHandle<PageTablePage>) -> PageHandle {
        assert!(
            self.slots.with_slot(handle, |_| ()).is_some(),
            "stale page-table handle"
        );
        self.slot_pages[handle.index()]
    }
}
