use core::{ops::ControlFlow, ptr::NonNull};
use std::collections::BTreeMap;

use crate::{
    allocator::{Allocator, AllocatorSettings, AllocatorStats},
    arena::SharedArena,
    config::SmallConfig,
    error::Error,
    mempool::{self, Pool, PoolStats},
};

/// Number of pools whose object size grows linearly.
pub const STEP_POOL_MAX: usize = 32;
/// Capacity of the factored pool cache.
pub const FACTOR_POOL_MAX: usize = 256;
/// Delayed objects reclaimed per allocation.
const DELAYED_BATCH: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolIdx {
    Step(usize),
    Factor(usize),
}

#[derive(Debug)]
struct FactorPool {
    pool: Pool,
    /// Smallest size served by this pool.
    objsize_min: usize,
}

/// Size-classed allocator over arena slabs.
///
/// Sizes up to the last stepped pool map to a pool by arithmetic. Larger
/// sizes go to factored pools whose object sizes grow geometrically; those
/// are created on demand, looked up by "smallest objsize not below the
/// request", and recycled once the pool cache runs dry.
pub struct SmallAllocator {
    arena: SharedArena,
    step: usize,
    step_pools: Vec<Pool>,
    step_pool_objsize_max: usize,
    factor_pools: Vec<FactorPool>,
    free_slots: Vec<usize>,
    tree: BTreeMap<usize, usize>,
    catch_all: usize,
    objsize_max: usize,
    factor: f32,
    delayed: Vec<(NonNull<u8>, usize)>,
    delayed_free_mode: bool,
}

unsafe impl Send for SmallAllocator {}

impl core::fmt::Debug for SmallAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmallAllocator")
            .field("step", &self.step)
            .field("step_pool_objsize_max", &self.step_pool_objsize_max)
            .field("objsize_max", &self.objsize_max)
            .field("factor", &self.factor)
            .field("factor_pools", &self.tree.len())
            .field("delayed", &self.delayed.len())
            .finish()
    }
}

impl SmallAllocator {
    /// Out-of-range settings are corrected rather than rejected; the factor
    /// actually used is reported by [`SmallAllocator::factor`].
    pub fn new(arena: SharedArena, conf: SmallConfig) -> Self {
        let slab_size = arena.slab_size();
        let step = conf.granularity.clamp(8, 256).next_power_of_two();
        let objsize_max = memory_addr::align_down(mempool::objsize_max(slab_size), step);

        let objsize_min = memory_addr::align_up(conf.objsize_min.max(step), step)
            .min(objsize_max - (STEP_POOL_MAX + 1) * step)
            .max(step);

        let step_pools: Vec<_> = (0..STEP_POOL_MAX)
            .map(|i| Pool::new(objsize_min + i * step, slab_size))
            .collect();
        let step_pool_objsize_max = objsize_min + (STEP_POOL_MAX - 1) * step;

        let mut factor = conf.alloc_factor.min(2.0);
        let smax = step_pool_objsize_max as f32;
        if smax * factor < smax + step as f32 {
            factor = (smax + step as f32 + 0.5) / smax;
        }

        let mut this = Self {
            arena,
            step,
            step_pools,
            step_pool_objsize_max,
            factor_pools: Vec::with_capacity(FACTOR_POOL_MAX),
            free_slots: Vec::new(),
            tree: BTreeMap::new(),
            catch_all: 0,
            objsize_max,
            factor,
            delayed: Vec::new(),
            delayed_free_mode: false,
        };
        this.catch_all = this.create_factor_pool(objsize_max).unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "small allocator created: objsize [{}, {}], step {}, factor {}",
            objsize_min,
            objsize_max,
            step,
            factor
        );

        this
    }

    #[inline]
    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    /// Growth factor of factored pools after correction.
    #[inline]
    pub fn factor(&self) -> f32 {
        self.factor
    }

    #[inline]
    pub fn objsize_max(&self) -> usize {
        self.objsize_max
    }

    #[inline]
    pub fn step_pool_objsize_max(&self) -> usize {
        self.step_pool_objsize_max
    }

    /// Live factored pools.
    #[inline]
    pub fn factor_pool_count(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    pub fn is_delayed_free_mode(&self) -> bool {
        self.delayed_free_mode
    }

    /// While on, [`SmallAllocator::free_delayed`] only queues objects; once
    /// off, queued objects are reclaimed in batches on allocation.
    #[inline]
    pub fn set_delayed_free_mode(&mut self, on: bool) {
        self.delayed_free_mode = on;
    }

    #[inline]
    fn step_index(&self, size: usize) -> usize {
        let base = self.step_pools[0].objsize();
        if size <= base {
            0
        } else {
            (size - base).div_ceil(self.step)
        }
    }

    /// Pool that owns objects of `size`. The same size always resolves to
    /// the same pool while an object of that size is alive.
    fn find_pool(&self, size: usize) -> Option<PoolIdx> {
        if size <= self.step_pool_objsize_max {
            return Some(PoolIdx::Step(self.step_index(size)));
        }
        let (_, &slot) = self.tree.range(size..).next()?;
        debug_assert!(size >= self.factor_pools[slot].objsize_min);
        Some(PoolIdx::Factor(slot))
    }

    fn next_slot(&mut self) -> Option<usize> {
        if let Some(slot) = self.free_slots.pop() {
            return Some(slot);
        }
        (self.factor_pools.len() < FACTOR_POOL_MAX).then_some(self.factor_pools.len())
    }

    /// Creates the factored pool for `size`, or returns `None` once the pool
    /// cache is exhausted.
    fn create_factor_pool(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size > self.step_pool_objsize_max && size <= self.objsize_max);
        let mut objsize = self.step_pool_objsize_max;
        let mut prevsize;
        loop {
            prevsize = objsize;
            let grown = (objsize as f64 * self.factor as f64) as usize;
            objsize = memory_addr::align_up(grown.max(objsize + 1), self.step);
            if objsize >= size {
                break;
            }
        }
        let objsize = objsize.min(self.objsize_max);
        if let Some(&existing) = self.tree.get(&objsize) {
            return Some(existing);
        }
        let slot = self.next_slot()?;

        let pool = FactorPool {
            pool: Pool::new(objsize, self.arena.slab_size()),
            objsize_min: prevsize + 1,
        };
        if slot == self.factor_pools.len() {
            self.factor_pools.push(pool);
        } else {
            self.factor_pools[slot] = pool;
        }
        self.tree.insert(objsize, slot);

        #[cfg(feature = "tracing")]
        tracing::debug!("factored pool [{}, {}] created", prevsize + 1, objsize);

        Some(slot)
    }

    /// Resolves the pool an allocation of `size` should come from, creating
    /// a tighter factored pool when the nearest one is too coarse.
    fn alloc_pool(&mut self, size: usize) -> Result<PoolIdx, Error> {
        if size <= self.step_pool_objsize_max {
            return Ok(PoolIdx::Step(self.step_index(size)));
        }
        let Some((_, &upper)) = self.tree.range(size..).next() else {
            return Err(Error::TooLarge {
                requested: size,
                bound: self.objsize_max,
            });
        };
        if size >= self.factor_pools[upper].objsize_min {
            return Ok(PoolIdx::Factor(upper));
        }
        match self.create_factor_pool(size) {
            Some(slot) => Ok(PoolIdx::Factor(slot)),
            None => {
                // Fall back to the coarser pool and widen its range so that
                // freeing by size still finds it.
                let lower = self
                    .tree
                    .range(..size)
                    .next_back()
                    .map_or(self.step_pool_objsize_max, |(&objsize, _)| objsize);
                self.factor_pools[upper].objsize_min = lower + 1;
                Ok(PoolIdx::Factor(upper))
            }
        }
    }

    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        self.free_batch();
        let idx = self.alloc_pool(size)?;
        match idx {
            PoolIdx::Step(i) => self.step_pools[i].alloc(&*self.arena),
            PoolIdx::Factor(slot) => self.factor_pools[slot].pool.alloc(&*self.arena),
        }
    }

    /// # Safety
    /// `ptr` must come from [`SmallAllocator::alloc`] with the same `size`
    /// and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let Some(idx) = self.find_pool(size) else {
            debug_assert!(false, "no pool serves {size} bytes");
            return;
        };
        match idx {
            PoolIdx::Step(i) => unsafe { self.step_pools[i].free(&*self.arena, ptr) },
            PoolIdx::Factor(slot) => {
                let pool = &mut self.factor_pools[slot].pool;
                unsafe { pool.free(&*self.arena, ptr) };
                if pool.used() == 0 {
                    self.recycle(slot);
                }
            }
        }
    }

    /// # Safety
    /// Same as [`SmallAllocator::free`].
    pub unsafe fn free_delayed(&mut self, ptr: NonNull<u8>, size: usize) {
        if self.delayed_free_mode {
            self.delayed.push((ptr, size));
        } else {
            unsafe { self.free(ptr, size) };
        }
    }

    fn free_batch(&mut self) {
        if self.delayed_free_mode || self.delayed.is_empty() {
            return;
        }
        for _ in 0..DELAYED_BATCH {
            let Some((ptr, size)) = self.delayed.pop() else {
                break;
            };
            unsafe { self.free(ptr, size) };
        }
    }

    /// An empty factored pool gives its slot back only when no slot is left
    /// for new pools. The catch-all pool is never recycled.
    fn recycle(&mut self, slot: usize) {
        let exhausted = self.free_slots.is_empty() && self.factor_pools.len() == FACTOR_POOL_MAX;
        if slot == self.catch_all || !exhausted {
            return;
        }
        let factor_pool = &mut self.factor_pools[slot];
        self.tree.remove(&factor_pool.pool.objsize());
        factor_pool.pool.destroy(&*self.arena);
        self.free_slots.push(slot);

        #[cfg(feature = "tracing")]
        tracing::debug!("factored pool {} recycled", factor_pool.pool.objsize());
    }

    /// Visits stepped pools, then factored pools by size. `cb` may stop the
    /// walk early; totals cover the visited pools.
    pub fn stats<F>(&self, mut cb: F) -> AllocatorStats
    where
        F: FnMut(&PoolStats) -> ControlFlow<()>,
    {
        let mut totals = AllocatorStats::default();
        let factored = self.tree.values().map(|&slot| &self.factor_pools[slot].pool);
        for pool in self.step_pools.iter().chain(factored) {
            let stats = pool.stats();
            totals.used += stats.bytes_used;
            totals.total += stats.slab_count * stats.slab_size;
            if cb(&stats).is_break() {
                break;
            }
        }
        totals
    }
}

impl Drop for SmallAllocator {
    fn drop(&mut self) {
        for pool in self.step_pools.iter_mut() {
            pool.destroy(&*self.arena);
        }
        for &slot in self.tree.values() {
            self.factor_pools[slot].pool.destroy(&*self.arena);
        }
    }
}

impl Allocator for SmallAllocator {
    const NAME: &'static str = "small";

    fn create(settings: &AllocatorSettings) -> Result<Self, Error> {
        Ok(Self::new(settings.arena.clone(), settings.small))
    }

    #[inline]
    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        SmallAllocator::alloc(self, size)
    }

    #[inline]
    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { SmallAllocator::free(self, ptr, size) }
    }

    #[inline]
    unsafe fn free_delayed(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { SmallAllocator::free_delayed(self, ptr, size) }
    }

    #[inline]
    fn set_delayed_free_mode(&mut self, on: bool) {
        SmallAllocator::set_delayed_free_mode(self, on)
    }

    #[inline]
    fn stats<F>(&self, cb: F) -> AllocatorStats
    where
        F: FnMut(&PoolStats) -> ControlFlow<()>,
    {
        SmallAllocator::stats(self, cb)
    }
}
