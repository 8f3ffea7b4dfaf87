use std::sync::Arc;

use crate::{
    error::Error,
    quota::{QUOTA_UNIT_SIZE, Quota},
    sys::SysAllocator,
};

#[test]
fn quota_follows_usage() {
    let quota = Arc::new(Quota::new(64 * QUOTA_UNIT_SIZE));
    let mut a = SysAllocator::new(quota.clone());

    let small = a.alloc(100).expect("should alloc");
    assert_eq!(a.used(), 100);
    assert_eq!(quota.used(), QUOTA_UNIT_SIZE);

    // still within the first unit
    let tiny = a.alloc(10).expect("should alloc");
    assert_eq!(quota.used(), QUOTA_UNIT_SIZE);

    let big = a.alloc(3 * QUOTA_UNIT_SIZE).expect("should alloc");
    assert_eq!(quota.used(), 4 * QUOTA_UNIT_SIZE);
    assert_eq!(a.stats().used, 110 + 3 * QUOTA_UNIT_SIZE);
    assert_eq!(a.stats().total, 4 * QUOTA_UNIT_SIZE);

    unsafe {
        a.free(big, 3 * QUOTA_UNIT_SIZE);
        a.free(small, 100);
    }
    assert_eq!(quota.used(), QUOTA_UNIT_SIZE);
    unsafe { a.free(tiny, 10) };
    assert_eq!(quota.used(), 0);
    assert_eq!(a.used(), 0);
}

#[test]
fn quota_exceeded() {
    let quota = Arc::new(Quota::new(4 * QUOTA_UNIT_SIZE));
    let mut a = SysAllocator::new(quota.clone());

    let ptr = a.alloc(3 * QUOTA_UNIT_SIZE).expect("should alloc");
    let err = a.alloc(2 * QUOTA_UNIT_SIZE).expect_err("should exceed");
    assert!(matches!(err, Error::QuotaExceeded { .. }));
    // a failed allocation leaves no trace
    assert_eq!(a.used(), 3 * QUOTA_UNIT_SIZE);
    assert_eq!(quota.used(), 3 * QUOTA_UNIT_SIZE);

    unsafe { a.free(ptr, 3 * QUOTA_UNIT_SIZE) };
}

#[test]
fn drop_releases_everything() {
    const ALLOC_NUM: usize = 50;

    let quota = Arc::new(Quota::new(usize::MAX));
    let mut a = SysAllocator::new(quota.clone());
    for _ in 0..ALLOC_NUM {
        let size = fastrand::usize(1..4096);
        let ptr = a.alloc(size).expect("should alloc");
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xAB, size) };
    }
    assert!(quota.used() > 0);

    drop(a);
    assert_eq!(quota.used(), 0);
}

#[test]
fn unlink_middle() {
    let quota = Arc::new(Quota::new(usize::MAX));
    let mut a = SysAllocator::new(quota);

    let ptrs: Vec<_> = (1..=5).map(|i| (a.alloc(i * 8).expect("should alloc"), i * 8)).collect();
    let (mid, size) = ptrs[2];
    unsafe { a.free(mid, size) };
    assert_eq!(a.used(), (8 + 16 + 32 + 40));

    for (i, &(ptr, size)) in ptrs.iter().enumerate() {
        if i != 2 {
            unsafe { a.free(ptr, size) };
        }
    }
    assert_eq!(a.used(), 0);
}
