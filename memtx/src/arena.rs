use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};
use memory_addr::{VirtAddr, VirtAddrRange};

use crate::{
    config::ArenaConfig,
    error::Error,
    os::{DefaultBackend, Mmap},
    quota::Quota,
};

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArenaFlags: u8 {
        const PRIVATE  = 0x1;
        const SHARED   = 0x1 << 1;
        /// Exclude slabs from core dumps.
        const DONTDUMP = 0x1 << 2;
    }
}

/// Smallest slab size. Slabs are aligned to their size, which keeps the low
/// [`TAG_BITS`] bits of every slab address free for the cache tag.
pub const SLAB_MIN_SIZE: usize = 1 << TAG_BITS;

const TAG_BITS: u32 = 16;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

/// Head of the free-slab cache: a slab address with a generation counter in
/// its low bits, so a pop racing with a pop-push of the same slab fails its
/// CAS instead of installing a stale link.
#[derive(Clone, Copy, PartialEq, Eq)]
struct TaggedSlab(usize);

impl core::fmt::Debug for TaggedSlab {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaggedSlab")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("tag", &self.tag())
            .finish()
    }
}

impl TaggedSlab {
    #[inline]
    const fn new(addr: usize, tag: u16) -> Self {
        debug_assert!(addr & TAG_MASK == 0);
        Self(addr | tag as usize)
    }

    #[inline]
    const fn addr(self) -> usize {
        self.0 & !TAG_MASK
    }

    #[inline]
    const fn tag(self) -> u16 {
        (self.0 & TAG_MASK) as u16
    }

    #[inline]
    const fn is_null(self) -> bool {
        self.addr() == 0
    }

    /// The link to the next cached slab lives in the slab's first word.
    ///
    /// # Safety
    /// The tagged address must be a slab mapped by the arena.
    #[inline]
    unsafe fn link<'a>(self) -> &'a AtomicUsize {
        unsafe { &*(self.addr() as *const AtomicUsize) }
    }
}

/// Hands out `slab_size`-aligned slabs of `slab_size` bytes.
///
/// Slabs come from the preallocated region first, then from fresh mappings
/// up to `maxalloc`. Released slabs go to a lock-free cache and are only
/// returned to the OS when the arena drops.
pub struct SlabArena<M: Mmap + ?Sized = DefaultBackend> {
    cache: CachePadded<AtomicUsize>,
    used: CachePadded<AtomicUsize>,
    region: VirtAddrRange,
    maxalloc: usize,
    slab_size: usize,
    flags: ArenaFlags,
    quota: Arc<Quota>,
    backend: M,
}

impl<M: Mmap + ?Sized> core::fmt::Debug for SlabArena<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlabArena")
            .field("used", &self.used())
            .field("prealloc", &self.prealloc())
            .field("maxalloc", &self.maxalloc)
            .field("slab_size", &self.slab_size)
            .field("flags", &self.flags)
            .finish()
    }
}

impl SlabArena {
    pub fn new(quota: Arc<Quota>, conf: ArenaConfig) -> Result<Self, Error> {
        Self::with_backend(quota, conf, DefaultBackend::default())
    }
}

/// An arena shared between allocators, with the backend erased.
pub type SharedArena = Arc<SlabArena<dyn Mmap>>;

impl<M: Mmap + 'static> SlabArena<M> {
    pub fn with_backend(quota: Arc<Quota>, conf: ArenaConfig, backend: M) -> Result<Self, Error> {
        let slab_size = conf.effective_slab_size();
        let prealloc = memory_addr::align_up(conf.prealloc, slab_size);
        let maxalloc = conf.maxalloc.max(prealloc);

        let start = if prealloc > 0 {
            backend.map(prealloc, slab_size, conf.flags)?.as_ptr() as usize
        } else {
            0
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "slab arena created: prealloc {} bytes, maxalloc {} bytes, slab {} bytes",
            prealloc,
            maxalloc,
            slab_size
        );

        Ok(Self {
            cache: CachePadded::new(AtomicUsize::new(0)),
            used: CachePadded::new(AtomicUsize::new(0)),
            region: VirtAddrRange::from_start_size(VirtAddr::from(start), prealloc),
            maxalloc,
            slab_size,
            flags: conf.flags,
            quota,
            backend,
        })
    }

    #[inline]
    pub fn shared(self) -> SharedArena {
        Arc::new(self)
    }
}

impl<M: Mmap + ?Sized> SlabArena<M> {
    #[inline]
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Bytes handed out from the region or fresh mappings, cached slabs
    /// included.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn prealloc(&self) -> usize {
        self.region.size()
    }

    #[inline]
    pub fn maxalloc(&self) -> usize {
        self.maxalloc
    }

    #[inline]
    pub fn flags(&self) -> ArenaFlags {
        self.flags
    }

    #[inline]
    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    /// Start of the slab that contains `ptr`.
    #[inline]
    pub fn slab_of(&self, ptr: *const u8) -> *mut u8 {
        memory_addr::align_down(ptr as usize, self.slab_size) as *mut u8
    }

    #[inline]
    fn in_region(&self, addr: usize) -> bool {
        self.region.contains(VirtAddr::from(addr))
    }

    /// Takes a slab from the cache, the preallocated region or a fresh
    /// mapping, in that order.
    pub fn map(&self) -> Result<NonNull<u8>, Error> {
        if let Some(slab) = self.pop_cache() {
            return Ok(slab);
        }

        self.quota.reserve(self.slab_size)?;
        let used = self.used.fetch_add(self.slab_size, Ordering::AcqRel) + self.slab_size;
        if used <= self.prealloc() {
            let addr = self.region.start.as_usize() + used - self.slab_size;
            // SAFETY: the region start is never null when it holds a slab.
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }

        if used > self.maxalloc {
            self.rollback();

            #[cfg(feature = "tracing")]
            tracing::warn!("slab arena exhausted: maxalloc {} bytes", self.maxalloc);

            return Err(Error::ArenaExhausted {
                used: used - self.slab_size,
                maxalloc: self.maxalloc,
            });
        }

        self.backend
            .map(self.slab_size, self.slab_size, self.flags)
            .inspect_err(|_| self.rollback())
    }

    #[inline]
    fn rollback(&self) {
        self.used.fetch_sub(self.slab_size, Ordering::AcqRel);
        self.quota.release(self.slab_size);
    }

    /// Returns a slab to the cache.
    ///
    /// # Safety
    /// `slab` must come from [`SlabArena::map`] of this arena and must not be
    /// used afterwards.
    pub unsafe fn unmap(&self, slab: NonNull<u8>) {
        let addr = slab.as_ptr() as usize;
        debug_assert_eq!(addr & (self.slab_size - 1), 0, "unaligned slab {addr:#x}");

        let backoff = Backoff::new();
        let link = unsafe { TaggedSlab::new(addr, 0).link() };
        let mut head = TaggedSlab(self.cache.load(Ordering::Acquire));
        loop {
            link.store(head.addr(), Ordering::Relaxed);
            let new = TaggedSlab::new(addr, head.tag().wrapping_add(1));
            match self.cache.compare_exchange_weak(
                head.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(changed) => {
                    head = TaggedSlab(changed);
                    backoff.spin();
                }
            }
        }
    }

    fn pop_cache(&self) -> Option<NonNull<u8>> {
        let backoff = Backoff::new();
        let mut head = TaggedSlab(self.cache.load(Ordering::Acquire));
        loop {
            if head.is_null() {
                return None;
            }
            // The slab stays mapped until the arena drops, so reading a link
            // that a racing owner overwrote is harmless: the tag check below
            // rejects it.
            let next = unsafe { head.link() }.load(Ordering::Relaxed);
            let new = TaggedSlab::new(next & !TAG_MASK, head.tag().wrapping_add(1));
            match self.cache.compare_exchange_weak(
                head.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(head.addr() as *mut u8),
                Err(changed) => {
                    head = TaggedSlab(changed);
                    backoff.spin();
                }
            }
        }
    }
}

impl<M: Mmap + ?Sized> Drop for SlabArena<M> {
    fn drop(&mut self) {
        let mut cached = 0;
        while let Some(slab) = self.pop_cache() {
            cached += self.slab_size;
            if !self.in_region(slab.as_ptr() as usize) {
                let res = unsafe { self.backend.unmap(slab, self.slab_size, self.slab_size) };
                if let Err(_err) = res {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("failed to unmap slab {:p}: {_err}", slab);
                }
            }
        }

        if let Some(start) = NonNull::new(self.region.start.as_usize() as *mut u8) {
            let res = unsafe { self.backend.unmap(start, self.prealloc(), self.slab_size) };
            if let Err(_err) = res {
                #[cfg(feature = "tracing")]
                tracing::warn!("failed to unmap preallocated region {:p}: {_err}", start);
            }
        }

        let used = self.used();
        self.quota.release(used);

        #[cfg(feature = "tracing")]
        tracing::debug!("slab arena destroyed: {} bytes returned", used);

        if !std::thread::panicking() {
            assert_eq!(cached, used, "slab arena dropped with slabs still in use");
        }
    }
}
