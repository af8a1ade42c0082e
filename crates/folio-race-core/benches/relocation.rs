//! Relocation benchmarks using Criterion, against the simulated kernel.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use folio_race_core::{
    Driver, PageMover, RegionPair, RelocationStats, ReproConfig, SimKernel, WaitStrategy,
    PAGE_SIZE,
};

const PAGES: usize = 256;

fn fresh_pair() -> (RegionPair, PageMover) {
    let config = ReproConfig::default().with_region_len(PAGES * PAGE_SIZE);
    let pair = RegionPair::setup(Arc::new(SimKernel::new()), &config).unwrap();
    let mover = PageMover::for_regions(&pair, Arc::new(RelocationStats::new()));
    (pair, mover)
}

fn benchmark_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    group.throughput(Throughput::Bytes((PAGES * PAGE_SIZE) as u64));

    group.bench_function("cold", |b| {
        b.iter_batched(
            fresh_pair,
            |(pair, mover)| {
                mover.sweep().unwrap();
                black_box(pair);
            },
            BatchSize::SmallInput,
        );
    });

    // Every page already resolved: measures the EEXIST path
    group.bench_function("resolved", |b| {
        let (_pair, mover) = fresh_pair();
        mover.sweep().unwrap();
        b.iter(|| mover.sweep().unwrap());
    });

    group.finish();
}

fn benchmark_iterations(c: &mut Criterion) {
    let mut group = c.benchmark_group("driver");
    group.sample_size(10);

    for workers in [1usize, 4] {
        group.bench_function(format!("{workers}_workers_4_iterations"), |b| {
            b.iter(|| {
                let config = ReproConfig::new(false, workers, 4)
                    .with_region_len(PAGES * PAGE_SIZE)
                    .with_wait(WaitStrategy::yielding());
                let driver = Driver::setup(Arc::new(SimKernel::new()), config).unwrap();
                black_box(driver.run(|_| {}).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_sweep, benchmark_iterations);
criterion_main!(benches);
