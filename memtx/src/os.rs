//! Backends that hand the arena raw, aligned memory.

#[cfg(all(unix, feature = "unix"))]
pub mod unix;

use core::ptr::NonNull;
use std::alloc::{self, Layout};

use crate::{arena::ArenaFlags, error::Error};

pub trait Mmap: Send + Sync {
    /// Maps `size` bytes whose start is aligned to `align`.
    fn map(&self, size: usize, align: usize, flags: ArenaFlags) -> Result<NonNull<u8>, Error>;

    /// # Safety
    /// `ptr`, `size` and `align` must describe a region returned by
    /// [`Mmap::map`] that is no longer referenced.
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), Error>;
}

/// Backs slabs with the global heap. Used on targets without `mmap` and by
/// tests that want to stay off the OS mapping path.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBackend;

impl Mmap for HeapBackend {
    fn map(&self, size: usize, align: usize, _flags: ArenaFlags) -> Result<NonNull<u8>, Error> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| Error::InvalidLayout { size, align })?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(Error::OutofMemory { requested: size })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), Error> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| Error::InvalidLayout { size, align })?;
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

#[cfg(all(unix, feature = "unix"))]
pub type DefaultBackend = unix::UnixBackend;
#[cfg(not(all(unix, feature = "unix")))]
pub type DefaultBackend = HeapBackend;
