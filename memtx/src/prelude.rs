pub mod allocator {
    pub use crate::allocator::{Allocator, AllocatorSettings, AllocatorStats};
    pub use crate::mempool::PoolStats;
    pub use crate::small::SmallAllocator;
    pub use crate::sys::SysAllocator;
}

pub mod arena {
    pub use crate::arena::{ArenaFlags, SharedArena, SlabArena};
    pub use crate::os::{DefaultBackend, HeapBackend, Mmap};
    pub use crate::quota::Quota;
}

pub mod memtx {
    pub use crate::allocators::{
        AllocatorKind, AllocatorVisitor, AllocatorsReadView, MemtxAllocators,
    };
    pub use crate::block::Block;
    pub use crate::memtx::{MemtxAllocator, MemtxAllocatorStats, ReadView};
}

pub use crate::config::{ArenaConfig, MemtxConfig, ReadViewOpts, SmallConfig};
pub use crate::error::Error;
