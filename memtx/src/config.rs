use crate::arena::{ArenaFlags, SLAB_MIN_SIZE};
use crate::quota::QUOTA_MAX;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArenaConfig {
    /// Bytes mapped up front and handed out before any further mapping.
    pub prealloc: usize,
    /// Upper bound on bytes the arena may ever hand out.
    pub maxalloc: usize,
    pub slab_size: usize,
    pub flags: ArenaFlags,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaConfig {
    pub const DEFAULT_SLAB_SIZE: usize = 4 << 20;

    pub const fn new() -> Self {
        Self {
            prealloc: 0,
            maxalloc: usize::MAX,
            slab_size: Self::DEFAULT_SLAB_SIZE,
            flags: ArenaFlags::PRIVATE,
        }
    }

    pub const fn with_prealloc(self, prealloc: usize) -> Self {
        Self { prealloc, ..self }
    }

    pub const fn with_maxalloc(self, maxalloc: usize) -> Self {
        Self { maxalloc, ..self }
    }

    pub const fn with_slab_size(self, slab_size: usize) -> Self {
        Self { slab_size, ..self }
    }

    pub const fn with_flags(self, flags: ArenaFlags) -> Self {
        Self { flags, ..self }
    }

    /// Slab size rounded up to a power of two no smaller than
    /// [`SLAB_MIN_SIZE`].
    #[inline]
    pub const fn effective_slab_size(&self) -> usize {
        let size = if self.slab_size < SLAB_MIN_SIZE {
            SLAB_MIN_SIZE
        } else {
            self.slab_size
        };
        size.next_power_of_two()
    }
}

/// Size-class layout of the small object allocator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmallConfig {
    pub objsize_min: usize,
    /// Alignment of every pool's object size and the stepped pool step.
    pub granularity: usize,
    pub alloc_factor: f32,
}

impl Default for SmallConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SmallConfig {
    pub const fn new() -> Self {
        Self {
            objsize_min: 16,
            granularity: 8,
            alloc_factor: 1.05,
        }
    }

    pub const fn with_objsize_min(self, objsize_min: usize) -> Self {
        Self {
            objsize_min,
            ..self
        }
    }

    pub const fn with_granularity(self, granularity: usize) -> Self {
        Self {
            granularity,
            ..self
        }
    }

    pub const fn with_alloc_factor(self, alloc_factor: f32) -> Self {
        Self {
            alloc_factor,
            ..self
        }
    }
}

/// Startup parameters of a [`crate::MemtxAllocators`] context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemtxConfig {
    pub quota: usize,
    pub arena: ArenaConfig,
    pub small: SmallConfig,
    /// Seconds during which a fresh read view may be shared by the next one.
    pub read_view_reuse_interval: f64,
}

impl Default for MemtxConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MemtxConfig {
    pub const DEFAULT_REUSE_INTERVAL: f64 = 0.1;

    pub const fn new() -> Self {
        Self {
            quota: QUOTA_MAX,
            arena: ArenaConfig::new(),
            small: SmallConfig::new(),
            read_view_reuse_interval: Self::DEFAULT_REUSE_INTERVAL,
        }
    }

    pub const fn with_quota(self, quota: usize) -> Self {
        Self { quota, ..self }
    }

    pub const fn with_arena(self, arena: ArenaConfig) -> Self {
        Self { arena, ..self }
    }

    pub const fn with_small(self, small: SmallConfig) -> Self {
        Self { small, ..self }
    }

    pub const fn with_read_view_reuse_interval(self, interval: f64) -> Self {
        Self {
            read_view_reuse_interval: interval,
            ..self
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadViewOpts {
    /// Whether the view also pins blocks of temporary spaces.
    pub enable_temporary_spaces: bool,
}

impl ReadViewOpts {
    pub const fn new() -> Self {
        Self {
            enable_temporary_spaces: false,
        }
    }

    pub const fn with_temporary_spaces(self, enable: bool) -> Self {
        Self {
            enable_temporary_spaces: enable,
        }
    }
}
