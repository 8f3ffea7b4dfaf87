mod latency;

use std::hint::black_box;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use criterion::{Criterion, criterion_group, criterion_main};
use memtx::prelude::{
    ArenaConfig, MemtxConfig, ReadViewOpts, SmallConfig,
    memtx::{AllocatorKind, Block, MemtxAllocators},
};

const SIZES: &[usize] = &[16, 64, 256, 1024, 4096, 16 << 10, 64 << 10];
const KINDS: &[AllocatorKind] = &[AllocatorKind::Small, AllocatorKind::System];

/// Blocks allocated per measured iteration.
const BATCH: usize = 1024;
const ARENA_SIZE: usize = 256 << 20;
const SLAB_SIZE: usize = 4 << 20;
const READ_VIEW_PROB: f32 = 0.05;

type BenchFn = fn(&mut MemtxAllocators, AllocatorKind, usize, usize) -> Duration;

fn mock_allocators() -> MemtxAllocators {
    let config = MemtxConfig::new()
        .with_arena(
            ArenaConfig::new()
                .with_prealloc(ARENA_SIZE)
                .with_slab_size(SLAB_SIZE),
        )
        .with_small(SmallConfig::new())
        .with_read_view_reuse_interval(0.0);
    MemtxAllocators::new(config).expect("should create")
}

#[inline]
fn alloc_batch(a: &mut MemtxAllocators, kind: AllocatorKind, size: usize, out: &mut Vec<Block>) {
    for _ in 0..BATCH {
        let block = a.alloc(kind, size, 0, false).expect("should alloc");
        out.push(black_box(block));
    }
}

#[inline]
fn free_batch(a: &mut MemtxAllocators, kind: AllocatorKind, blocks: &mut Vec<Block>) {
    for block in blocks.drain(..) {
        a.free(kind, block, false);
    }
}

/// Allocate and free with no read view open.
fn churn(a: &mut MemtxAllocators, kind: AllocatorKind, iters: usize, size: usize) -> Duration {
    let mut blocks = Vec::with_capacity(BATCH);
    let start = Instant::now();
    for _ in 0..iters {
        alloc_batch(a, kind, size, &mut blocks);
        free_batch(a, kind, &mut blocks);
    }
    start.elapsed()
}

/// Every freed block is pinned by a read view and reclaimed by later
/// allocations once the view closes.
fn pinned(a: &mut MemtxAllocators, kind: AllocatorKind, iters: usize, size: usize) -> Duration {
    let opts = ReadViewOpts::new();
    let mut blocks = Vec::with_capacity(BATCH);
    let start = Instant::now();
    for _ in 0..iters {
        alloc_batch(a, kind, size, &mut blocks);
        let rv = a.open_read_view(&opts);
        free_batch(a, kind, &mut blocks);
        a.close_read_view(rv);
    }
    while a.collect_garbage() {}
    start.elapsed()
}

/// Random sizes up to `size` with read views opened and closed at random.
fn mixed(a: &mut MemtxAllocators, kind: AllocatorKind, iters: usize, size: usize) -> Duration {
    let opts = ReadViewOpts::new();
    let mut live: Vec<(Block, usize)> = Vec::with_capacity(BATCH);
    let mut views = Vec::new();
    let start = Instant::now();
    for _ in 0..iters * BATCH {
        if fastrand::f32() < READ_VIEW_PROB {
            if views.is_empty() || fastrand::bool() {
                views.push(a.open_read_view(&opts));
            } else {
                let rv = views.swap_remove(fastrand::usize(..views.len()));
                a.close_read_view(rv);
            }
        }
        if live.len() < BATCH && (live.is_empty() || fastrand::bool()) {
            let len = fastrand::usize(1..=size);
            let block = a.alloc(kind, len, 0, false).expect("should alloc");
            live.push((black_box(block), len));
        } else {
            let (block, _) = live.swap_remove(fastrand::usize(..live.len()));
            a.free(kind, block, false);
        }
    }
    for (block, _) in live {
        a.free(kind, block, false);
    }
    for rv in views {
        a.close_read_view(rv);
    }
    while a.collect_garbage() {}
    start.elapsed()
}

fn groups(c: &mut Criterion) {
    #[cfg(feature = "tracing")]
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    macro_rules! benches {
        ($($name:ident),* $(,)?) => ([$((stringify!($name), $name as BenchFn),)*]);
    }

    let mut a = mock_allocators();
    let mut g = c.benchmark_group("alloc_benchmark");
    for (i, size) in SIZES.iter().copied().enumerate() {
        let bsize = ByteSize::b(size as u64).display().iec_short();

        for &kind in KINDS {
            latency::report(&mut a, kind, size);

            for (name, f) in benches![churn, pinned, mixed] {
                let id = format!("alloc_benchmark_{i:02}_{bsize:.0}_{kind}_{name}");
                g.bench_function(&id, |b| {
                    b.iter_custom(|iters| f(&mut a, kind, iters as usize, size))
                });
            }
        }
    }
}

criterion_group!(
    name = alloc_benchmark;
    config = Criterion::default().sample_size(50).measurement_time(Duration::from_secs(10));
    targets = groups
);
criterion_main!(alloc_benchmark);
