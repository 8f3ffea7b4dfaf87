use core::{ops::ControlFlow, ptr::NonNull};
use std::sync::Arc;

use crate::{
    arena::SharedArena, config::SmallConfig, error::Error, mempool::PoolStats, quota::Quota,
};

/// Everything an allocation strategy needs to come up.
#[derive(Clone, Debug)]
pub struct AllocatorSettings {
    /// Slab source for the small object allocator.
    pub arena: SharedArena,
    /// Budget charged by the system allocator.
    pub quota: Arc<Quota>,
    pub small: SmallConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub used: usize,
    pub total: usize,
}

impl core::ops::AddAssign for AllocatorStats {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.used += rhs.used;
        self.total += rhs.total;
    }
}

/// The verbs every allocation strategy provides. Destruction is `Drop`.
pub trait Allocator: Sized + Send {
    const NAME: &'static str;

    fn create(settings: &AllocatorSettings) -> Result<Self, Error>;

    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error>;

    /// # Safety
    /// `ptr` must come from [`Allocator::alloc`] of this allocator with the
    /// same `size` and must not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize);

    /// Frees `ptr`, or queues it while delayed free mode is on.
    ///
    /// # Safety
    /// Same as [`Allocator::free`].
    unsafe fn free_delayed(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.free(ptr, size) }
    }

    fn set_delayed_free_mode(&mut self, _on: bool) {}

    /// Walks per-pool statistics; strategies without pools never call `cb`.
    fn stats<F>(&self, cb: F) -> AllocatorStats
    where
        F: FnMut(&PoolStats) -> ControlFlow<()>;
}
