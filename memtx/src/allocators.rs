use core::{fmt, str::FromStr};
use std::sync::Arc;

use crate::{
    allocator::{Allocator, AllocatorSettings},
    arena::{SharedArena, SlabArena},
    block::Block,
    config::{MemtxConfig, ReadViewOpts},
    error::Error,
    memtx::{MemtxAllocator, MemtxAllocatorStats, ReadView},
    os::Mmap,
    quota::Quota,
    small::SmallAllocator,
    sys::SysAllocator,
};

/// Strategy a space allocates its tuples with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    #[default]
    Small,
    System,
}

impl AllocatorKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Small => SmallAllocator::NAME,
            Self::System => SysAllocator::NAME,
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllocatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "system" => Ok(Self::System),
            _ => Err(Error::UnknownAllocator(s.to_owned())),
        }
    }
}

/// Operation applied to every allocator of a [`MemtxAllocators`].
pub trait AllocatorVisitor {
    fn visit<A: Allocator>(&mut self, allocator: &mut MemtxAllocator<A>);
}

/// Read view spanning every allocator of a [`MemtxAllocators`].
#[must_use = "a read view pins freed blocks until it is closed"]
#[derive(Debug)]
pub struct AllocatorsReadView {
    small: ReadView,
    sys: ReadView,
}

impl AllocatorsReadView {
    #[inline]
    pub fn small(&self) -> &ReadView {
        &self.small
    }

    #[inline]
    pub fn sys(&self) -> &ReadView {
        &self.sys
    }
}

/// The allocation context of a storage engine: one quota, one arena, and an
/// MVCC allocator per strategy.
pub struct MemtxAllocators {
    // Allocators drop before the arena they carve from.
    small: MemtxAllocator<SmallAllocator>,
    sys: MemtxAllocator<SysAllocator>,
    arena: SharedArena,
    quota: Arc<Quota>,
}

impl fmt::Debug for MemtxAllocators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemtxAllocators")
            .field("small", &self.small)
            .field("sys", &self.sys)
            .field("arena", &self.arena)
            .field("quota", &self.quota)
            .finish()
    }
}

impl MemtxAllocators {
    pub fn new(config: MemtxConfig) -> Result<Self, Error> {
        let quota = Arc::new(Quota::new(config.quota));
        let arena = SlabArena::new(quota.clone(), config.arena)?.shared();
        Self::from_parts(config, quota, arena)
    }

    /// Like [`MemtxAllocators::new`] with slabs mapped by `backend`.
    pub fn with_backend<M: Mmap + 'static>(config: MemtxConfig, backend: M) -> Result<Self, Error> {
        let quota = Arc::new(Quota::new(config.quota));
        let arena = SlabArena::with_backend(quota.clone(), config.arena, backend)?.shared();
        Self::from_parts(config, quota, arena)
    }

    fn from_parts(
        config: MemtxConfig,
        quota: Arc<Quota>,
        arena: SharedArena,
    ) -> Result<Self, Error> {
        let settings = AllocatorSettings {
            arena: arena.clone(),
            quota: quota.clone(),
            small: config.small,
        };
        let mut this = Self {
            small: MemtxAllocator::create(&settings)?,
            sys: MemtxAllocator::create(&settings)?,
            arena,
            quota,
        };
        this.set_read_view_reuse_interval(config.read_view_reuse_interval);

        #[cfg(feature = "tracing")]
        tracing::info!(
            "memtx allocators ready: quota {} bytes, slab {} bytes",
            this.quota.total(),
            this.arena.slab_size()
        );

        Ok(this)
    }

    #[inline]
    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    #[inline]
    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    #[inline]
    pub fn small(&self) -> &MemtxAllocator<SmallAllocator> {
        &self.small
    }

    #[inline]
    pub fn small_mut(&mut self) -> &mut MemtxAllocator<SmallAllocator> {
        &mut self.small
    }

    #[inline]
    pub fn sys(&self) -> &MemtxAllocator<SysAllocator> {
        &self.sys
    }

    #[inline]
    pub fn sys_mut(&mut self) -> &mut MemtxAllocator<SysAllocator> {
        &mut self.sys
    }

    pub fn alloc(
        &mut self,
        kind: AllocatorKind,
        data_size: usize,
        data_offset: usize,
        compact: bool,
    ) -> Result<Block, Error> {
        match kind {
            AllocatorKind::Small => self.small.alloc(data_size, data_offset, compact),
            AllocatorKind::System => self.sys.alloc(data_size, data_offset, compact),
        }
    }

    /// `block` must have been allocated with the same `kind`.
    pub fn free(&mut self, kind: AllocatorKind, block: Block, is_temporary: bool) {
        match kind {
            AllocatorKind::Small => self.small.free(block, is_temporary),
            AllocatorKind::System => self.sys.free(block, is_temporary),
        }
    }

    pub fn open_read_view(&mut self, opts: &ReadViewOpts) -> AllocatorsReadView {
        AllocatorsReadView {
            small: self.small.open_read_view(opts),
            sys: self.sys.open_read_view(opts),
        }
    }

    pub fn close_read_view(&mut self, rv: AllocatorsReadView) {
        self.small.close_read_view(rv.small);
        self.sys.close_read_view(rv.sys);
    }

    /// Runs one collection step on every allocator. Returns whether garbage
    /// remains anywhere.
    pub fn collect_garbage(&mut self) -> bool {
        let small = self.small.collect_garbage();
        let sys = self.sys.collect_garbage();
        small || sys
    }

    pub fn set_read_view_reuse_interval(&mut self, interval: f64) {
        self.small.set_read_view_reuse_interval(interval);
        self.sys.set_read_view_reuse_interval(interval);
    }

    pub fn stats(&self) -> MemtxAllocatorStats {
        let mut stats = self.small.stats();
        stats += self.sys.stats();
        stats
    }

    pub fn for_each<V: AllocatorVisitor>(&mut self, visitor: &mut V) {
        visitor.visit(&mut self.small);
        visitor.visit(&mut self.sys);
    }
}
