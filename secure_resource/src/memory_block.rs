use core::mem::size_of;

use static_assertions::const_assert;

use crate::PAGE_SIZE;

/// State of the guest mapping described by a [`MemoryBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryState {
    #[default]
    Free,
    Normal,
    Code,
    CodeData,
    Stack,
    Io,
}

/// Access permission of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPermission {
    #[default]
    None,
    Read,
    ReadWrite,
    ReadExecute,
}

/// Descriptor of one contiguous guest mapping; lives in the memory-block
/// slab heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBlock {
    pub base_address: u64,
    pub num_pages: usize,
    pub state: MemoryState,
    pub permission: MemoryPermission,
}

/// Address/length record used while mappings are built up or torn down;
/// lives in the block-info slab heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    pub address: u64,
    pub num_pages: usize,
}

/// Marker for one page-table page.
///
/// The page itself is accounted inside the emulated secure region (one
/// page per slot); its contents are not modeled on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTablePage;

const_assert!(size_of::<MemoryBlock>() <= PAGE_SIZE);
const_assert!(size_of::<BlockInfo>() <= PAGE_SIZE);
