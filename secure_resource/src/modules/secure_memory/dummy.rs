use super::{Pool, SecureMemoryModule};
use crate::address::{PhysicalAddress, SecureAddress};
use crate::error::Result;

/// Placeholder platform module; every call aborts.
pub struct DummySecureMemoryModule;

impl SecureMemoryModule for DummySecureMemoryModule {
    fn allocate_secure_memory(&self, _size: usize, _pool: Pool) -> Result<SecureAddress> {
        panic!("not implemented")
    }

    fn free_secure_memory(&self, _address: SecureAddress, _size: usize, _pool: Pool) {
        panic!("not implemented")
    }

    fn physical_address(&self, _address: SecureAddress) -> Result<PhysicalAddress> {
        panic!("not implemented")
    }
}
