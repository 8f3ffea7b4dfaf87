use core::ptr::NonNull;
use std::sync::Arc;

use super::SLAB_SIZE;
use crate::{
    arena::{ArenaFlags, SlabArena},
    config::ArenaConfig,
    error::Error,
    os::{HeapBackend, Mmap},
    quota::Quota,
    tests::tracing_init,
};

/// Maps from the heap but refuses to give anything back.
struct StickyBackend;

impl Mmap for StickyBackend {
    fn map(&self, size: usize, align: usize, flags: ArenaFlags) -> Result<NonNull<u8>, Error> {
        HeapBackend.map(size, align, flags)
    }

    unsafe fn unmap(&self, _ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), Error> {
        Err(Error::InvalidLayout { size, align })
    }
}

#[test]
fn drop_survives_unmap_failure() {
    tracing_init();
    let quota = Arc::new(Quota::new(usize::MAX));
    let conf = ArenaConfig::new()
        .with_prealloc(SLAB_SIZE)
        .with_slab_size(SLAB_SIZE);
    let arena = SlabArena::with_backend(quota.clone(), conf, StickyBackend).expect("should create");

    let inside = arena.map().expect("should map");
    let outside = arena.map().expect("should map");
    assert_eq!(quota.used(), 2 * SLAB_SIZE);
    unsafe {
        arena.unmap(inside);
        arena.unmap(outside);
    }

    drop(arena);
    assert_eq!(quota.used(), 0);
}
