use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};

pub use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::mman;

use crate::{arena::ArenaFlags, error::Error, os::Mmap};

/// Anonymous `mmap` backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixBackend;

#[inline]
fn as_c_void(ptr: usize) -> Option<NonNull<c_void>> {
    NonNull::new(ptr as *mut c_void)
}

impl From<ArenaFlags> for MapFlags {
    fn from(value: ArenaFlags) -> Self {
        if value.contains(ArenaFlags::SHARED) {
            MapFlags::MAP_SHARED
        } else {
            MapFlags::MAP_PRIVATE
        }
    }
}

impl UnixBackend {
    fn map_raw(&self, size: usize, flags: ArenaFlags) -> Result<usize, Error> {
        let len = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        let ptr = unsafe {
            mman::mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags.into(),
            )?
        };
        Ok(ptr.as_ptr() as usize)
    }

    fn unmap_raw(&self, start: usize, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Ok(());
        }
        let ptr = as_c_void(start).ok_or(nix::Error::EINVAL)?;
        unsafe { mman::munmap(ptr, size)? };
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn dontdump(&self, start: usize, size: usize) {
        let Some(ptr) = as_c_void(start) else {
            return;
        };
        // Failing to exclude the range from core dumps is not fatal.
        if let Err(_err) = unsafe { mman::madvise(ptr, size, mman::MmapAdvise::MADV_DONTDUMP) } {
            #[cfg(feature = "tracing")]
            tracing::warn!("madvise(MADV_DONTDUMP) failed: {_err}");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn dontdump(&self, _start: usize, _size: usize) {}
}

impl Mmap for UnixBackend {
    fn map(&self, size: usize, align: usize, flags: ArenaFlags) -> Result<NonNull<u8>, Error> {
        debug_assert!(align.is_power_of_two());
        // Map twice the size and trim the unaligned head and tail.
        let raw = self.map_raw(size + align, flags)?;
        let start = memory_addr::align_up(raw, align);
        let head = start - raw;
        let tail = align - head;
        if let Err(err) = self.unmap_raw(raw, head) {
            let _ = self.unmap_raw(raw, size + align);
            return Err(err);
        }
        if let Err(err) = self.unmap_raw(start + size, tail) {
            let _ = self.unmap_raw(start, size + tail);
            return Err(err);
        }

        if flags.contains(ArenaFlags::DONTDUMP) {
            self.dontdump(start, size);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("mapped {} bytes at {:#x}", size, start);

        NonNull::new(start as *mut u8).ok_or(Error::OutofMemory { requested: size })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, _align: usize) -> Result<(), Error> {
        self.unmap_raw(ptr.as_ptr() as usize, size)
    }
}
