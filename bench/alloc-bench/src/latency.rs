use std::hint::black_box;
use std::time::Instant;

use hdrhistogram::Histogram;
use memtx::prelude::{
    ReadViewOpts,
    memtx::{AllocatorKind, MemtxAllocators},
};

use crate::BATCH;

const ROUNDS: usize = 64;

/// Prints single-allocation latency percentiles while read views keep
/// pinning freed blocks, which is when allocation also pays for collection.
pub(crate) fn report(a: &mut MemtxAllocators, kind: AllocatorKind, size: usize) {
    let Ok(mut hist) = Histogram::<u64>::new_with_bounds(1, 10_000_000, 3) else {
        return;
    };
    let opts = ReadViewOpts::new();
    let mut blocks = Vec::with_capacity(BATCH);

    for _ in 0..ROUNDS {
        let rv = a.open_read_view(&opts);
        for _ in 0..BATCH {
            let start = Instant::now();
            let block = a.alloc(kind, size, 0, false).expect("should alloc");
            let _ = hist.record(start.elapsed().as_nanos() as u64);
            blocks.push(black_box(block));
        }
        let rv2 = a.open_read_view(&opts);
        for block in blocks.drain(..) {
            a.free(kind, block, false);
        }
        a.close_read_view(rv);
        a.close_read_view(rv2);
    }
    while a.collect_garbage() {}

    eprintln!(
        "{kind} {size}B alloc latency: p50 {}ns p99 {}ns p99.9 {}ns max {}ns",
        hist.value_at_quantile(0.5),
        hist.value_at_quantile(0.99),
        hist.value_at_quantile(0.999),
        hist.max(),
    );
}
