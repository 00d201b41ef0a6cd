use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::memory_block::MemoryBlock;
use crate::test::get_test_resource;
use crate::PAGE_SIZE;

const THREADS: usize = 64;
const ATTEMPTS_PER_THREAD: usize = 100;

#[test]
fn test_concurrent_allocations_never_overlap() {
    // A small region, so the 6400 attempts overrun the capacity and the
    // OutOfMemory path is exercised as well.
    let (resource, _limit, _platform) = get_test_resource(16 * PAGE_SIZE, 1024 * 1024);
    let manager = resource.memory_block_manager();
    let capacity = manager.capacity();
    assert!(capacity < THREADS * ATTEMPTS_PER_THREAD);

    let handles = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let mut local = Vec::new();
                for _ in 0..ATTEMPTS_PER_THREAD {
                    if let Ok(handle) = manager.allocate(MemoryBlock::default()) {
                        local.push(handle);
                    }
                }
                handles.lock().unwrap().extend(local);
            });
        }
    });

    let handles = handles.into_inner().unwrap();

    // No two successful allocations share a slot, nobody got more than the
    // capacity, and the used count matches the survivors exactly.
    let unique: HashSet<_> = handles.iter().copied().collect();
    assert_eq!(unique.len(), handles.len());
    assert_eq!(handles.len(), capacity);
    assert_eq!(manager.used(), handles.len());

    for handle in handles {
        manager.free(handle);
    }
    assert_eq!(manager.used(), 0);

    resource.finalize();
}

#[test]
fn test_concurrent_churn_keeps_the_used_count_consistent() {
    let (resource, _limit, _platform) = get_test_resource(64 * PAGE_SIZE, 1024 * 1024);
    let manager = resource.block_info_manager();

    let successes = AtomicUsize::new(0);
    let frees = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                for round in 0..50 {
                    let mut local = Vec::new();
                    for _ in 0..(round % 7 + 1) {
                        if let Ok(handle) = manager.allocate(Default::default()) {
                            successes.fetch_add(1, Ordering::AcqRel);
                            local.push(handle);
                        }
                    }
                    for handle in local {
                        manager.free(handle);
                        frees.fetch_add(1, Ordering::AcqRel);
                    }
                }
            });
        }
    });

    let successes = successes.load(Ordering::Acquire);
    let frees = frees.load(Ordering::Acquire);
    assert_eq!(successes, frees);
    assert_eq!(manager.used(), 0);

    resource.finalize();
}

#[test]
fn test_concurrent_page_reference_counting() {
    let (resource, _limit, _platform) = get_test_resource(64 * PAGE_SIZE, 1024 * 1024);
    let page_tables = resource.page_table_manager();

    let handle = page_tables.allocate().unwrap();

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..1000 {
                    page_tables.open_page(handle);
                    page_tables.close_page(handle);
                }
            });
        }
    });

    assert_eq!(page_tables.page_ref_count(handle), 0);
    page_tables.free(handle);

    resource.finalize();
}

#[test]
fn test_randomized_alloc_free_stress() {
    const SEED: u64 = 0x5ec0_4e5a_11c3_7ab1;

    let (resource, _limit, _platform) = get_test_resource(32 * PAGE_SIZE, 1024 * 1024);
    let manager = resource.memory_block_manager();
    let mut rand = SmallRng::seed_from_u64(SEED);

    let mut live = Vec::new();
    for step in 0..10_000 {
        if live.is_empty() || rand.gen_range(0..100) < 60 {
            match manager.allocate(MemoryBlock {
                base_address: step as u64 * PAGE_SIZE as u64,
                num_pages: 1,
                ..MemoryBlock::default()
            }) {
                Ok(handle) => live.push(handle),
                Err(_) => {
                    // Pool full: drain a little and move on.
                    let handle = live.swap_remove(rand.gen_range(0..live.len()));
                    manager.free(handle);
                }
            }
        } else {
            let handle = live.swap_remove(rand.gen_range(0..live.len()));
            manager.free(handle);
        }

        assert_eq!(manager.used(), live.len());
    }

    for handle in live {
        manager.free(handle);
    }
    resource.finalize();
}
