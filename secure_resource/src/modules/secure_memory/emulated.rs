use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::{debug, trace};

use super::{Pool, SecureMemoryModule, POOL_COUNT};
use crate::address::{PhysicalAddress, SecureAddress};
use crate::error::{KernelError, Result};
use crate::util::align_up;
use crate::PAGE_SIZE;

/// First emulated physical address handed out for secure regions.
pub const SECURE_MEMORY_BASE: u64 = 0x8000_0000;

struct Region {
    size: usize,
    pool: Pool,
}

struct EmulatedState {
    next_address: u64,
    pool_used: [usize; POOL_COUNT],
    regions: HashMap<u64, Region>,
}

/// Host-side emulation of the platform's secure memory carve-out.
///
/// Each pool has a byte capacity. Regions come page aligned from a
/// monotonic cursor, a region table validates frees and translations, and
/// translation is identity mapped.
pub struct EmulatedSecureMemoryModule {
    pool_capacity: [usize; POOL_COUNT],
    state: Mutex<EmulatedState>,
}

impl EmulatedSecureMemoryModule {
    pub fn new(pool_capacity: [usize; POOL_COUNT]) -> Self {
        Self {
            pool_capacity,
            state: Mutex::new(EmulatedState {
                next_address: SECURE_MEMORY_BASE,
                pool_used: [0; POOL_COUNT],
                regions: HashMap::new(),
            }),
        }
    }

    /// Same byte capacity for every pool.
    pub fn with_uniform_capacity(capacity: usize) -> Self {
        Self::new([capacity; POOL_COUNT])
    }

    pub fn pool_capacity(&self, pool: Pool) -> usize {
        self.pool_capacity[pool.index()]
    }

    pub fn pool_used(&self, pool: Pool) -> usize {
        self.lock().pool_used[pool.index()]
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().expect("platform state poisoned")
    }
}

impl Default for EmulatedSecureMemoryModule {
    /// 64 MiB per pool, plenty for every guest this emulation models.
    fn default() -> Self {
        Self::with_uniform_capacity(64 * 1024 * 1024)
    }
}

impl SecureMemoryModule for EmulatedSecureMemoryModule {
    fn allocate_secure_memory(&self, size: usize, pool: Pool) -> Result<SecureAddress> {
        assert!(size > 0, "zero-sized secure allocation");

        let mut state = self.lock();
        let used = state.pool_used[pool.index()];
        if used + size > self.pool_capacity[pool.index()] {
            debug!(
                "{} pool exhausted: {} bytes used, {} requested",
                pool.name(),
                used,
                size
            );
            return Err(KernelError::OutOfMemory);
        }

        let address = state.next_address;
        state.next_address += align_up(size, PAGE_SIZE) as u64;
        state.pool_used[pool.index()] += size;
        state.regions.insert(address, Region { size, pool });

        trace!(
            "secure region {:#x} (+{} bytes) carved from the {} pool",
            address,
            size,
            pool.name()
        );
        Ok(SecureAddress::from_u64(address))
    }

    fn free_secure_memory(&self, address: SecureAddress, size: usize, pool: Pool) {
        let mut state = self.lock();
        let region = state
            .regions
            .remove(&address.as_u64())
            .unwrap_or_else(|| panic!("free of unknown secure region {}", address));
        assert!(
            region.size == size && region.pool == pool,
            "secure region {} freed with mismatched size or pool",
            address
        );

        state.pool_used[pool.index()] -= size;
        trace!(
            "secure region {} returned to the {} pool",
            address,
            pool.name()
        );
    }

    fn physical_address(&self, address: SecureAddress) -> Result<PhysicalAddress> {
        let state = self.lock();
        let value = address.as_u64();

        for (base, region) in state.regions.iter() {
            if value >= *base && value < *base + region.size as u64 {
                return Ok(PhysicalAddress::from_u64(value));
            }
        }
        Err(KernelError::InvalidAddress)
    }
}
