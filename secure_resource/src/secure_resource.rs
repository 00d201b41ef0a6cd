use core::alloc::Layout;
use std::sync::Arc;

use log::{debug, warn};

use crate::address::SecureAddress;
use crate::dynamic_page_manager::DynamicPageManager;
use crate::error::{KernelError, Result};
use crate::heap_partition::HeapPartitionPolicy;
use crate::memory_block::{BlockInfo, MemoryBlock, PageTablePage};
use crate::modules::secure_memory::{Pool, SecureMemoryModule};
use crate::ref_count_table::RefCountTable;
use crate::resource_limit::{LimitableResource, ResourceLimit};
use crate::slab_heap::SlabHeap;
use crate::slab_manager::{BlockInfoManager, MemoryBlockSlabManager, PageTableManager};
use crate::util::{align_up, div_ceil};
use crate::PAGE_SIZE;

/// Frees the secure region on drop unless disarmed; covers every failure
/// path between platform allocation and commit.
struct SecureRegionGuard<'a, S: SecureMemoryModule> {
    secure_memory: &'a S,
    address: SecureAddress,
    size: usize,
    pool: Pool,
    armed: bool,
}

impl<'a, S: SecureMemoryModule> SecureRegionGuard<'a, S> {
    fn new(secure_memory: &'a S, address: SecureAddress, size: usize, pool: Pool) -> Self {
        Self {
            secure_memory,
            address,
            size,
            pool,
            armed: true,
        }
    }

    fn release(mut self) -> SecureAddress {
        self.armed = false;
        self.address
    }
}

impl<S: SecureMemoryModule> Drop for SecureRegionGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            warn!("rolling back secure region {}", self.address);
            self.secure_memory
                .free_secure_memory(self.address, self.size, self.pool);
        }
    }
}

/// A process's private carve-out of secure memory together with the three
/// slab managers that back its kernel metadata.
///
/// Construction runs the whole acquisition protocol or rolls back to zero
/// side effects; teardown is the consuming [`finalize`](Self::finalize).
/// Because both take the value itself, a double initialize or a second
/// finalize cannot be expressed.
pub struct SecureResource<S: SecureMemoryModule> {
    secure_memory: S,
    resource_limit: Arc<ResourceLimit>,

    address: SecureAddress,
    size: usize,
    pool: Pool,

    page_manager: DynamicPageManager,
    page_table_manager: PageTableManager,
    memory_block_manager: MemoryBlockSlabManager,
    block_info_manager: BlockInfoManager,

    finalized: bool,
}

impl<S: SecureMemoryModule> std::fmt::Debug for SecureResource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureResource")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("pool", &self.pool)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl<S: SecureMemoryModule> SecureResource<S> {
    /// Builds a ready resource with the default heap partition policy.
    pub fn initialize(
        secure_memory: S,
        size: usize,
        resource_limit: Arc<ResourceLimit>,
        pool: Pool,
    ) -> Result<Self> {
        Self::initialize_with_policy(
            secure_memory,
            size,
            resource_limit,
            pool,
            HeapPartitionPolicy::default(),
        )
    }

    /// Builds a ready resource.
    ///
    /// Reserves the required capacity against `resource_limit`, carves the
    /// region out of `pool`, wires up the reference-count table, the page
    /// pool and the three managers, then commits the reservation. Any
    /// failure on the way out leaves no residual state: the reservation is
    /// cancelled and the region returned to the platform.
    pub fn initialize_with_policy(
        secure_memory: S,
        size: usize,
        resource_limit: Arc<ResourceLimit>,
        pool: Pool,
        policy: HeapPartitionPolicy,
    ) -> Result<Self> {
        assert!(size > 0, "secure resource of zero size");

        // The charge covers platform overhead on top of the raw request,
        // so reservation and physical backing can never drift apart.
        let secure_size = secure_memory.calculate_required_secure_memory_size(size, pool);
        let reservation =
            resource_limit.reserve(LimitableResource::PhysicalMemory, secure_size as u64)?;

        // From here on the guard hands the region back on every failure
        // path.
        let address = secure_memory.allocate_secure_memory(size, pool)?;
        assert!(!address.is_null(), "platform returned a null region");
        let region = SecureRegionGuard::new(&secure_memory, address, size, pool);

        // The reference-count table is carved out of the region itself;
        // a region that cannot hold it is useless.
        let table_size = align_up(RefCountTable::calculate_size(size, PAGE_SIZE), PAGE_SIZE);
        if size <= table_size {
            return Err(KernelError::OutOfMemory);
        }

        // Locate the reference-count table inside the region.
        let table_address = secure_memory.physical_address(address)?;

        // The rest of the region backs the page pool.
        let table_pages = table_size / PAGE_SIZE;
        let mut page_manager = DynamicPageManager::new(
            address.offset(table_size),
            table_pages,
            size - table_size,
            PAGE_SIZE,
        );

        // Carve the pool into the three typed heaps.
        let partition = policy.partition(page_manager.page_count());
        debug!(
            "partitioning {} pages: {:?}",
            page_manager.page_count(),
            partition
        );

        let page_layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE)
            .expect("should not fail: power-of-two page size");
        let page_table_heap =
            SlabHeap::<PageTablePage>::new(&mut page_manager, partition.page_table_pages, page_layout)?;
        let memory_block_heap = SlabHeap::<MemoryBlock>::new(
            &mut page_manager,
            partition.memory_block_pages,
            Layout::new::<MemoryBlock>(),
        )?;
        let block_info_heap = SlabHeap::<BlockInfo>::new(
            &mut page_manager,
            partition.block_info_pages,
            Layout::new::<BlockInfo>(),
        )?;

        let ref_counts = RefCountTable::new(div_ceil(size, PAGE_SIZE));
        let page_table_manager = PageTableManager::new(page_table_heap, ref_counts, table_address);
        let memory_block_manager = MemoryBlockSlabManager::new(memory_block_heap);
        let block_info_manager = BlockInfoManager::new(block_info_heap);

        // Nothing can fail past this point: make the charge permanent and
        // keep the limit alive for our lifetime.
        let address = region.release();
        reservation.commit();
        resource_limit.open();

        debug!(
            "secure resource ready at {} ({} bytes from the {} pool)",
            address,
            size,
            pool.name()
        );

        Ok(Self {
            secure_memory,
            resource_limit,
            address,
            size,
            pool,
            page_manager,
            page_table_manager,
            memory_block_manager,
            block_info_manager,
            finalized: false,
        })
    }

    /// Tears the resource down and undoes the initialization charges.
    ///
    /// Every manager has to be empty: outstanding kernel metadata at
    /// teardown is a caller defect and aborts rather than being silently
    /// force freed.
    pub fn finalize(mut self) {
        assert!(
            self.memory_block_manager.used() == 0,
            "memory blocks still allocated at finalize"
        );
        assert!(
            self.block_info_manager.used() == 0,
            "block infos still allocated at finalize"
        );
        assert!(
            self.page_table_manager.used() == 0,
            "page-table pages still allocated at finalize"
        );

        self.secure_memory
            .free_secure_memory(self.address, self.size, self.pool);

        // Recomputed with the same pure sizing function, so exactly the
        // reserved amount flows back.
        let secure_size = self
            .secure_memory
            .calculate_required_secure_memory_size(self.size, self.pool);
        self.resource_limit
            .release(LimitableResource::PhysicalMemory, secure_size as u64);

        self.resource_limit.close();

        self.finalized = true;
        debug!("secure resource at {} finalized", self.address);
    }

    pub fn address(&self) -> SecureAddress {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    /// What this resource charged against its limit.
    pub fn required_secure_memory_size(&self) -> usize {
        self.secure_memory
            .calculate_required_secure_memory_size(self.size, self.pool)
    }

    pub fn page_table_manager(&self) -> &PageTableManager {
        &self.page_table_manager
    }

    pub fn memory_block_manager(&self) -> &MemoryBlockSlabManager {
        &self.memory_block_manager
    }

    pub fn block_info_manager(&self) -> &BlockInfoManager {
        &self.block_info_manager
    }

    pub fn resource_limit(&self) -> &Arc<ResourceLimit> {
        &self.resource_limit
    }

    /// Pages of the region still unassigned after the heap partition.
    pub fn free_page_count(&self) -> usize {
        self.page_manager.free_page_count()
    }
}

impl<S: SecureMemoryModule> Drop for SecureResource<S> {
    fn drop(&mut self) {
        if !self.finalized && !std::thread::panicking() {
            panic!("secure resource dropped without finalize");
        }
    }
}
