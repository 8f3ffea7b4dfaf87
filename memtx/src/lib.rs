//! Memory allocation core of an in-memory storage engine.
//!
//! The stack, bottom-up: a [`Quota`] bounds the memory budget, a
//! [`SlabArena`] carves aligned slabs under that quota, [`SmallAllocator`]
//! serves size-classed objects out of those slabs, [`SysAllocator`] offers
//! the same verbs on top of the system heap, and [`MemtxAllocator`] wraps
//! either strategy to keep freed blocks alive while an open read view may
//! still see them.

#[cfg(feature = "tracing")]
extern crate tracing;

mod allocator;
mod allocators;
mod arena;
mod block;
mod clock;
mod config;
mod error;
mod header;
mod memtx;
mod mempool;
pub mod os;
pub mod prelude;
mod quota;
mod small;
mod sys;

pub use self::allocator::{Allocator, AllocatorSettings, AllocatorStats};
pub use self::allocators::{
    AllocatorKind, AllocatorVisitor, AllocatorsReadView, MemtxAllocators,
};
pub use self::arena::{ArenaFlags, SLAB_MIN_SIZE, SharedArena, SlabArena};
pub use self::block::Block;
pub use self::config::{ArenaConfig, MemtxConfig, ReadViewOpts, SmallConfig};
pub use self::error::Error;
pub use self::memtx::{GC_BATCH_SIZE, MemtxAllocator, MemtxAllocatorStats, ReadView};
pub use self::mempool::PoolStats;
pub use self::quota::{QUOTA_MAX, QUOTA_UNIT_SIZE, Quota};
pub use self::small::{FACTOR_POOL_MAX, STEP_POOL_MAX, SmallAllocator};
pub use self::sys::SysAllocator;

mod numeric {
    pub trait Packable: Sized {
        type Packed;

        fn pack(first: Self, second: Self) -> Self::Packed;
        fn unpack(packed: Self::Packed) -> (Self, Self);
    }

    macro_rules! pack_bits {
        (unpack:$unpack:ty, pack:$pack:ty) => {
            impl Packable for $unpack {
                type Packed = $pack;

                #[inline]
                fn pack(first: Self, second: Self) -> Self::Packed {
                    const BITS: u32 = <$unpack>::BITS;
                    ((first as Self::Packed) << BITS) | (second as Self::Packed)
                }

                #[inline]
                fn unpack(packed: Self::Packed) -> (Self, Self) {
                    const BITS: u32 = <$unpack>::BITS;
                    let first = (packed >> BITS) as Self;
                    let second = (packed & ((1 << BITS) - 1)) as Self;
                    (first, second)
                }
            }
        };
    }

    pack_bits!(unpack:u32, pack:u64);

    /// Rounds `n` up to a whole number of `unit`s and returns the count.
    #[inline]
    pub const fn units(n: usize, unit: usize) -> usize {
        n.div_ceil(unit)
    }

}
