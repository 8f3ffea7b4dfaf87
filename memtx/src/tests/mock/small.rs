use core::ops::ControlFlow;

use super::mock_small;
use crate::{
    config::SmallConfig,
    error::Error,
    small::{FACTOR_POOL_MAX, SmallAllocator},
    tests::tracing_init,
};

fn live_objects(a: &SmallAllocator) -> usize {
    let mut count = 0;
    a.stats(|stats| {
        count += stats.object_count;
        ControlFlow::Continue(())
    });
    count
}

#[test]
fn rand_round_trip() {
    const ALLOC_NUM: usize = 500;

    tracing_init();
    let mut a = mock_small(SmallConfig::new());
    let objsize_max = a.objsize_max();

    let objs: Vec<_> = (0..ALLOC_NUM)
        .map(|i| {
            let size = fastrand::usize(1..=objsize_max);
            let ptr = a.alloc(size).expect("should alloc");
            assert_eq!(ptr.as_ptr() as usize % 8, 0);
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), i as u8, size) };
            (ptr, size, i as u8)
        })
        .collect();
    assert_eq!(live_objects(&a), ALLOC_NUM);

    for (ptr, size, byte) in objs {
        let data = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(data.iter().all(|&b| b == byte));
        unsafe { a.free(ptr, size) };
    }
    assert_eq!(live_objects(&a), 0);
}

#[test]
fn too_large() {
    let mut a = mock_small(SmallConfig::new());
    let bound = a.objsize_max();

    let ptr = a.alloc(bound).expect("should alloc");
    unsafe { a.free(ptr, bound) };

    assert_eq!(
        a.alloc(bound + 1),
        Err(Error::TooLarge {
            requested: bound + 1,
            bound,
        })
    );
}

#[test]
fn factor_pools_on_demand() {
    let mut a = mock_small(SmallConfig::new());
    // the catch-all pool exists from the start
    assert_eq!(a.factor_pool_count(), 1);

    let size = a.step_pool_objsize_max() + 1;
    let first = a.alloc(size).expect("should alloc");
    assert_eq!(a.factor_pool_count(), 2);
    let second = a.alloc(size).expect("should alloc");
    assert_eq!(a.factor_pool_count(), 2);

    unsafe {
        a.free(first, size);
        a.free(second, size);
    }
    // plenty of room left in the pool cache, nothing is recycled
    assert_eq!(a.factor_pool_count(), 2);

    let step = a.alloc(a.step_pool_objsize_max()).expect("should alloc");
    assert_eq!(a.factor_pool_count(), 2);
    unsafe { a.free(step, a.step_pool_objsize_max()) };
}

#[test]
fn delayed_free_mode() {
    const SIZE: usize = 32;
    const NUM: usize = 10;

    let mut a = mock_small(SmallConfig::new());
    a.set_delayed_free_mode(true);
    assert!(a.is_delayed_free_mode());

    let objs: Vec<_> = (0..NUM).map(|_| a.alloc(SIZE).expect("should alloc")).collect();
    for obj in objs {
        unsafe { a.free_delayed(obj, SIZE) };
    }
    assert_eq!(live_objects(&a), NUM);

    // still on: allocation does not reclaim
    let extra = a.alloc(SIZE).expect("should alloc");
    assert_eq!(live_objects(&a), NUM + 1);

    a.set_delayed_free_mode(false);
    let last = a.alloc(SIZE).expect("should alloc");
    assert_eq!(live_objects(&a), 2);

    unsafe {
        a.free_delayed(extra, SIZE);
        a.free(last, SIZE);
    }
    assert_eq!(live_objects(&a), 0);
}

#[test]
fn stats_walk() {
    let mut a = mock_small(SmallConfig::new());
    let sizes = [16, 100, a.step_pool_objsize_max() + 1, a.objsize_max()];
    let objs: Vec<_> = sizes
        .iter()
        .map(|&size| (a.alloc(size).expect("should alloc"), size))
        .collect();

    let mut seen = Vec::new();
    let totals = a.stats(|stats| {
        seen.push(stats.objsize);
        ControlFlow::Continue(())
    });
    assert!(seen.is_sorted());
    assert!(totals.used >= sizes.iter().sum::<usize>());
    assert!(totals.total >= totals.used);

    let mut visited = 0;
    let first = a.stats(|stats| {
        visited += 1;
        assert_eq!(stats.object_count, 1);
        ControlFlow::Break(())
    });
    assert_eq!(visited, 1);
    assert_eq!(first.used, 16);

    for (obj, size) in objs {
        unsafe { a.free(obj, size) };
    }
}

#[test]
fn factor_correction() {
    let a = mock_small(SmallConfig::new().with_alloc_factor(1.0));
    let smax = a.step_pool_objsize_max() as f32;
    assert!(a.factor() * smax >= smax + 8.0);

    let a = mock_small(SmallConfig::new().with_alloc_factor(3.0));
    assert_eq!(a.factor(), 2.0);
}

#[test]
fn granularity_rounds_up() {
    let mut a = mock_small(SmallConfig::new().with_granularity(12).with_objsize_min(20));
    let ptr = a.alloc(1).expect("should alloc");

    let mut objsize = 0;
    a.stats(|stats| {
        if stats.object_count > 0 {
            objsize = stats.objsize;
        }
        ControlFlow::Continue(())
    });
    assert_eq!(objsize, 32);
    unsafe { a.free(ptr, 1) };
}

/// Fills the factored pool cache, overflows into the next larger pool, then
/// frees and allocates again so that every size keeps resolving to the pool
/// its object lives in.
#[test]
fn factor_pool_cache_exhausted() {
    const STEP: usize = 8;

    tracing_init();
    // A high base with no growth gives many narrow factored pools.
    let mut a = mock_small(SmallConfig::new().with_objsize_min(4096).with_alloc_factor(1.0));
    let objsize_max = a.objsize_max();
    let catch_all_count = |a: &SmallAllocator| {
        let mut count = 0;
        a.stats(|stats| {
            if stats.objsize == objsize_max {
                count = stats.object_count;
            }
            ControlFlow::Continue(())
        });
        count
    };

    // one object per pool, until the cache runs out
    let mut pinned = Vec::new();
    let mut size = a.step_pool_objsize_max() + 1;
    while a.factor_pool_count() < FACTOR_POOL_MAX {
        assert!(size < objsize_max / 4 * 3);
        let pools = a.factor_pool_count();
        let ptr = a.alloc(size).expect("should alloc");
        if a.factor_pool_count() > pools {
            pinned.push((ptr, size));
        } else {
            unsafe { a.free(ptr, size) };
        }
        size += STEP;
    }
    assert_eq!(pinned.len(), FACTOR_POOL_MAX - 1);

    // no slot left: sizes above the last pool go to the catch-all pool
    let last = pinned.last().map_or(0, |&(_, size)| size);
    let wide = (last + objsize_max) / 2;
    let mut spilled = Vec::new();
    for size in [wide, wide + STEP] {
        spilled.push((a.alloc(size).expect("should alloc"), size));
    }
    assert_eq!(a.factor_pool_count(), FACTOR_POOL_MAX);
    assert_eq!(catch_all_count(&a), 2);

    // only the first emptied pool gives its slot back
    let (kept, freed): (Vec<_>, Vec<_>) = pinned
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 1);
    let first = freed[0].1.1;
    for (_, (ptr, size)) in freed {
        unsafe { a.free(ptr, size) };
    }
    assert_eq!(a.factor_pool_count(), FACTOR_POOL_MAX - 1);

    // the freed slot serves a pool for the first size again
    let again = a.alloc(first).expect("should alloc");
    assert_eq!(a.factor_pool_count(), FACTOR_POOL_MAX);
    // the widened range still ends up in the catch-all pool
    spilled.push((a.alloc(wide + 2 * STEP).expect("should alloc"), wide + 2 * STEP));
    assert_eq!(a.factor_pool_count(), FACTOR_POOL_MAX);
    assert_eq!(catch_all_count(&a), 3);

    unsafe { a.free(again, first) };
    for (ptr, size) in kept.into_iter().map(|(_, obj)| obj).chain(spilled) {
        unsafe { a.free(ptr, size) };
    }
    assert_eq!(live_objects(&a), 0);
    assert_eq!(catch_all_count(&a), 0);
    assert!(a.factor_pool_count() >= 1);

    let ptr = a.alloc(objsize_max).expect("should alloc");
    unsafe { a.free(ptr, objsize_max) };
}
