use std::sync::Arc;

use env_logger::{Builder, Env};

use secure_resource::modules::secure_memory::{EmulatedSecureMemoryModule, Pool};
use secure_resource::{
    LimitableResource, MemoryBlock, MemoryPermission, MemoryState, ResourceLimit, SecureResource,
};

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Trace)
        .format_module_path(false)
        .init();

    let platform = EmulatedSecureMemoryModule::default();
    let limit = Arc::new(ResourceLimit::new());
    limit
        .set_limit_value(LimitableResource::PhysicalMemory, 8 * 1024 * 1024)
        .unwrap();

    let resource =
        SecureResource::initialize(platform, 1024 * 1024, limit.clone(), Pool::Application)
            .unwrap();

    println!(
        "secure region at {} ({} bytes, {} charged against the limit)",
        resource.address(),
        resource.size(),
        resource.required_secure_memory_size()
    );
    println!(
        "slots: {} page tables, {} memory blocks, {} block infos",
        resource.page_table_manager().capacity(),
        resource.memory_block_manager().capacity(),
        resource.block_info_manager().capacity()
    );

    let block = resource
        .memory_block_manager()
        .allocate(MemoryBlock {
            base_address: 0x4000_0000,
            num_pages: 16,
            state: MemoryState::Normal,
            permission: MemoryPermission::ReadWrite,
        })
        .unwrap();

    let table = resource.page_table_manager().allocate().unwrap();
    resource.page_table_manager().open_page(table);

    println!(
        "in use: {} memory blocks, {} page-table pages",
        resource.memory_block_manager().used(),
        resource.page_table_manager().used()
    );

    resource.page_table_manager().close_page(table);
    resource.page_table_manager().free(table);
    resource.memory_block_manager().free(block);

    resource.finalize();

    println!(
        "finalized, {} bytes still charged",
        limit.current_value(LimitableResource::PhysicalMemory)
    );
}
