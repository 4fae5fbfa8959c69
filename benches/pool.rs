use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagepool::Pool;

/// Variable-size hot loop against the system allocator baseline.
fn variable_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    for size in [64usize, 512, 4096] {
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, &size| {
            let pool = Pool::new(64 * 1024 * 1024).unwrap();
            pool.warmup();

            b.iter(|| {
                let p = pool.alloc(black_box(size)).unwrap();
                unsafe { pool.free(p).unwrap() };
            });
        });

        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            let layout = std::alloc::Layout::from_size_align(size, 64).unwrap();

            b.iter(|| unsafe {
                let p = std::alloc::alloc(layout);
                std::alloc::dealloc(black_box(p), layout);
            });
        });
    }

    group.finish();
}

/// O(1) class path, the latency floor of the pool.
fn fixed_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_alloc_free");

    for size in [64usize, 1536] {
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("class", size), &size, |b, &size| {
            let pool = Pool::new(64 * 1024 * 1024).unwrap();
            pool.add_size_class(size, 4096).unwrap();
            pool.warmup();

            b.iter(|| {
                let p = pool.alloc_fixed(black_box(size)).unwrap();
                unsafe { pool.free_fixed(p).unwrap() };
            });
        });
    }

    group.finish();
}

criterion_group!(benches, variable_path, fixed_path);
criterion_main!(benches);
