use core::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam_queue::SegQueue;

use crate::{
    arena::{ArenaFlags, SLAB_MIN_SIZE, SlabArena},
    config::ArenaConfig,
    error::Error,
    quota::Quota,
    tests::{prob, tracing_init},
};

const SLAB: usize = SLAB_MIN_SIZE;

fn mock_arena(quota: usize, conf: ArenaConfig) -> SlabArena {
    let quota = Arc::new(Quota::new(quota));
    SlabArena::new(quota, conf.with_slab_size(SLAB)).expect("should create")
}

#[test]
fn slabs_aligned() {
    const NUM: usize = 8;

    tracing_init();
    let arena = mock_arena(usize::MAX, ArenaConfig::new());
    let slabs: Vec<_> = (0..NUM).map(|_| arena.map().expect("should map")).collect();
    for slab in &slabs {
        assert_eq!(slab.as_ptr() as usize % SLAB, 0);
        // slabs are writable end to end
        unsafe { core::ptr::write_bytes(slab.as_ptr(), 0x11, SLAB) };
        assert_eq!(arena.slab_of(unsafe { slab.as_ptr().add(SLAB - 1) }), slab.as_ptr());
    }
    assert_eq!(arena.used(), NUM * SLAB);
    assert_eq!(arena.quota().used(), NUM * SLAB);

    for slab in slabs {
        unsafe { arena.unmap(slab) };
    }
}

#[test]
fn cache_is_lifo() {
    let arena = mock_arena(usize::MAX, ArenaConfig::new());
    let a = arena.map().expect("should map");
    let b = arena.map().expect("should map");
    unsafe {
        arena.unmap(a);
        arena.unmap(b);
    }
    // cached slabs stay accounted as used
    assert_eq!(arena.used(), 2 * SLAB);

    assert_eq!(arena.map().expect("should map"), b);
    assert_eq!(arena.map().expect("should map"), a);
    assert_eq!(arena.used(), 2 * SLAB);
    unsafe {
        arena.unmap(a);
        arena.unmap(b);
    }
}

#[test]
fn maxalloc_bound() {
    let arena = mock_arena(usize::MAX, ArenaConfig::new().with_maxalloc(2 * SLAB));
    let a = arena.map().expect("should map");
    let b = arena.map().expect("should map");
    assert_eq!(
        arena.map(),
        Err(Error::ArenaExhausted {
            used: 2 * SLAB,
            maxalloc: 2 * SLAB,
        })
    );
    assert_eq!(arena.used(), 2 * SLAB);
    assert_eq!(arena.quota().used(), 2 * SLAB);

    unsafe { arena.unmap(b) };
    let c = arena.map().expect("should reuse");
    assert_eq!(c, b);
    unsafe {
        arena.unmap(a);
        arena.unmap(c);
    }
}

#[test]
fn quota_bound() {
    let arena = mock_arena(SLAB, ArenaConfig::new());
    let a = arena.map().expect("should map");
    let err = arena.map().expect_err("should exceed");
    assert!(matches!(err, Error::QuotaExceeded { .. }));
    assert_eq!(arena.used(), SLAB);

    // raising the quota lets the arena grow again
    arena.quota().set(2 * SLAB).expect("should set");
    let b = arena.map().expect("should map");
    unsafe {
        arena.unmap(a);
        arena.unmap(b);
    }
}

#[test]
fn prealloc_region() {
    const NUM: usize = 4;

    let quota = Arc::new(Quota::new(usize::MAX));
    let conf = ArenaConfig::new()
        .with_prealloc(NUM * SLAB - 1)
        .with_slab_size(SLAB)
        .with_flags(ArenaFlags::PRIVATE | ArenaFlags::DONTDUMP);
    let arena = SlabArena::new(quota.clone(), conf).expect("should create");
    assert_eq!(arena.prealloc(), NUM * SLAB);
    // the region is charged slab by slab
    assert_eq!(quota.used(), 0);

    let slabs: Vec<_> = (0..NUM).map(|_| arena.map().expect("should map")).collect();
    let start = slabs[0].as_ptr() as usize;
    for (i, slab) in slabs.iter().enumerate() {
        assert_eq!(slab.as_ptr() as usize, start + i * SLAB);
    }
    let outside = arena.map().expect("should map");
    assert!(!(start..start + NUM * SLAB).contains(&(outside.as_ptr() as usize)));

    for slab in slabs.into_iter().chain([outside]) {
        unsafe { arena.unmap(slab) };
    }
    drop(arena);
    assert_eq!(quota.used(), 0);
}

fn as_slab(addr: usize) -> Option<NonNull<u8>> {
    NonNull::new(addr as *mut u8)
}

#[test]
fn concurrent_map_unmap() {
    const NUM: usize = 4;
    const ROUNDS: usize = 1000;
    const UNMAP_PROB: f32 = 0.5;

    tracing_init();
    let arena = mock_arena(usize::MAX, ArenaConfig::new().with_prealloc(8 * SLAB));
    let slabs = SegQueue::new();
    let bar = Barrier::new(NUM);

    thread::scope(|s| {
        for _ in 0..NUM {
            let arena = &arena;
            let slabs = &slabs;
            let bar = &bar;
            s.spawn(move || {
                bar.wait();
                for _ in 0..ROUNDS {
                    if prob(UNMAP_PROB) {
                        if let Some(slab) = slabs.pop().and_then(as_slab) {
                            unsafe { arena.unmap(slab) };
                            continue;
                        }
                    }
                    let slab = arena.map().expect("should map");
                    // claim the slab to catch double hand-outs
                    unsafe { slab.cast::<u64>().add(1).write(slab.as_ptr() as u64) };
                    slabs.push(slab.as_ptr() as usize);
                }
            });
        }
    });

    let mut seen = std::collections::HashSet::new();
    while let Some(slab) = slabs.pop().and_then(as_slab) {
        assert!(seen.insert(slab.as_ptr() as usize), "slab handed out twice");
        assert_eq!(
            unsafe { slab.cast::<u64>().add(1).read() },
            slab.as_ptr() as u64
        );
        unsafe { arena.unmap(slab) };
    }
    tracing::debug!("arena after stress: {:?}", arena);
}
