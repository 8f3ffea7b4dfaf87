use core::{mem, ops::ControlFlow, ptr::NonNull};
use std::{
    alloc::{self, Layout as AllocLayout},
    sync::Arc,
    thread::{self, ThreadId},
};

use crate::{
    allocator::{Allocator, AllocatorSettings, AllocatorStats},
    error::Error,
    header::{Layout, Magic},
    mempool::PoolStats,
    quota::{QUOTA_UNIT_SIZE, Quota},
};

const ALIGN: usize = 16;
const HEADER_SIZE: usize = memory_addr::align_up(mem::size_of::<SysHeader>(), ALIGN);

#[repr(C)]
struct SysHeader {
    magic: Magic,
    size: usize,
    prev: *mut SysHeader,
    next: *mut SysHeader,
}

impl Layout for SysHeader {
    const MAGIC: Magic = 0x5A5A;

    #[inline]
    fn magic(&self) -> Magic {
        self.magic
    }
}

#[inline]
fn layout_of(size: usize) -> Result<AllocLayout, Error> {
    size.checked_add(HEADER_SIZE)
        .and_then(|total| AllocLayout::from_size_align(total, ALIGN).ok())
        .ok_or(Error::InvalidLayout { size, align: ALIGN })
}

/// Strategy backed by the system heap.
///
/// Live allocations are linked through a header in front of each of them so
/// that dropping the allocator releases everything still outstanding. Usage
/// is charged to a shared [`Quota`] in whole units.
pub struct SysAllocator {
    quota: Arc<Quota>,
    head: *mut SysHeader,
    used: usize,
    owner: Option<ThreadId>,
}

unsafe impl Send for SysAllocator {}

impl core::fmt::Debug for SysAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SysAllocator")
            .field("used", &self.used)
            .field("quota", &self.quota)
            .finish()
    }
}

impl SysAllocator {
    pub fn new(quota: Arc<Quota>) -> Self {
        Self {
            quota,
            head: core::ptr::null_mut(),
            used: 0,
            owner: None,
        }
    }

    /// Bytes handed out and not yet freed.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    #[inline]
    fn check_thread(&mut self) {
        let current = thread::current().id();
        let owner = *self.owner.get_or_insert(current);
        debug_assert_eq!(owner, current, "system allocator used from two threads");
    }

    /// Quota units the allocator holds for `used` bytes.
    #[inline]
    fn charged(used: usize) -> usize {
        used.div_ceil(QUOTA_UNIT_SIZE) * QUOTA_UNIT_SIZE
    }

    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        if cfg!(debug_assertions) {
            self.check_thread();
        }
        let layout = layout_of(size)?;

        let delta = Self::charged(self.used + size) - Self::charged(self.used);
        if delta > 0 {
            self.quota.reserve(delta)?;
        }

        let Some(raw) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            if delta > 0 {
                self.quota.release(delta);
            }
            return Err(Error::OutofMemory { requested: size });
        };

        let hdr = raw.cast::<SysHeader>();
        unsafe {
            hdr.as_ptr().write(SysHeader {
                magic: SysHeader::MAGIC,
                size,
                prev: core::ptr::null_mut(),
                next: self.head,
            });
            if let Some(mut head) = NonNull::new(self.head) {
                head.as_mut().prev = hdr.as_ptr();
            }
        }
        self.head = hdr.as_ptr();
        self.used += size;

        Ok(unsafe { raw.add(HEADER_SIZE) })
    }

    /// # Safety
    /// `ptr` must come from [`SysAllocator::alloc`] with the same `size` and
    /// must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        if cfg!(debug_assertions) {
            self.check_thread();
        }
        let raw = unsafe { ptr.sub(HEADER_SIZE) };
        let hdr = unsafe { SysHeader::from_raw(raw.cast::<SysHeader>().as_ptr()) };
        debug_assert_eq!(hdr.size, size, "size mismatch on free");
        let size = hdr.size;

        match NonNull::new(hdr.prev) {
            Some(mut prev) => unsafe { prev.as_mut().next = hdr.next },
            None => self.head = hdr.next,
        }
        if let Some(mut next) = NonNull::new(hdr.next) {
            unsafe { next.as_mut().prev = hdr.prev };
        }

        let delta = Self::charged(self.used) - Self::charged(self.used - size);
        self.used -= size;
        if delta > 0 {
            self.quota.release(delta);
        }

        if let Ok(layout) = layout_of(size) {
            unsafe { alloc::dealloc(raw.as_ptr(), layout) };
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            used: self.used,
            total: Self::charged(self.used),
        }
    }
}

impl Drop for SysAllocator {
    fn drop(&mut self) {
        let mut cur = self.head;
        while let Some(hdr) = NonNull::new(cur) {
            let (next, size) = unsafe { (hdr.as_ref().next, hdr.as_ref().size) };
            if let Ok(layout) = layout_of(size) {
                unsafe { alloc::dealloc(hdr.as_ptr().cast(), layout) };
            }
            cur = next;
        }
        self.head = core::ptr::null_mut();
        self.quota.release(Self::charged(self.used));
        self.used = 0;
    }
}

impl Allocator for SysAllocator {
    const NAME: &'static str = "system";

    fn create(settings: &AllocatorSettings) -> Result<Self, Error> {
        Ok(Self::new(settings.quota.clone()))
    }

    #[inline]
    fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        SysAllocator::alloc(self, size)
    }

    #[inline]
    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { SysAllocator::free(self, ptr, size) }
    }

    fn stats<F>(&self, _cb: F) -> AllocatorStats
    where
        F: FnMut(&PoolStats) -> ControlFlow<()>,
    {
        SysAllocator::stats(self)
    }
}
