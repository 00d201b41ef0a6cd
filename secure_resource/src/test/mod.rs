use std::sync::Arc;

use crate::modules::secure_memory::test::CountingSecureMemoryModule;
use crate::modules::secure_memory::Pool;
use crate::resource_limit::{LimitableResource, ResourceLimit};
use crate::secure_resource::SecureResource;

mod concurrency;

pub(crate) const TEST_POOL_CAPACITY: usize = 64 * 1024 * 1024;

/// Builds a ready resource of `size` bytes against a fresh limit of
/// `limit` bytes.
///
/// Returns the limit and the platform handle as well, so tests can observe
/// both sides of the protocol.
pub(crate) fn get_test_resource(
    size: usize,
    limit: u64,
) -> (
    SecureResource<CountingSecureMemoryModule>,
    Arc<ResourceLimit>,
    CountingSecureMemoryModule,
) {
    let _ = env_logger::builder().is_test(true).try_init();

    let secure_memory = CountingSecureMemoryModule::new(TEST_POOL_CAPACITY);
    let resource_limit = Arc::new(ResourceLimit::new());
    resource_limit
        .set_limit_value(LimitableResource::PhysicalMemory, limit)
        .unwrap();

    let resource = SecureResource::initialize(
        secure_memory.clone(),
        size,
        resource_limit.clone(),
        Pool::Application,
    )
    .expect("test resource should initialize");

    (resource, resource_limit, secure_memory)
}
