// Arena allocator benchmarks.
//
// These measure allocation/free churn under the free-list allocator,
// including the cost of slab growth and variable-arena size-class
// dispatch.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxidex_mem::{Arena, VArena};

/// Benchmark alloc-then-free churn for a single chunk size.
///
/// This measures the steady-state free-list hit path once the arena has
/// grown enough slabs to avoid further system allocator calls.
fn bench_alloc_free_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_alloc_free");

    for size in &[16usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut arena = Arena::new(8, size).unwrap();
            // Warm up a few slabs so the benchmark measures free-list reuse.
            let warm: Vec<_> = (0..256).map(|_| arena.alloc().unwrap()).collect();
            for p in warm {
                arena.free(p);
            }

            b.iter(|| {
                let p = arena.alloc().unwrap();
                arena.free(black_box(p));
            });
        });
    }

    group.finish();
}

/// Benchmark slab growth by allocating without ever freeing.
fn bench_slab_growth(c: &mut Criterion) {
    c.bench_function("arena_slab_growth", |b| {
        b.iter(|| {
            let mut arena = Arena::new(8, 16).unwrap();
            for _ in 0..1000 {
                black_box(arena.alloc().unwrap());
            }
        });
    });
}

/// Benchmark varena size-class dispatch across a range of tail counts.
fn bench_varena_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("varena_alloc");

    for count in &[1usize, 16, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let mut varena = VArena::new(8, 16, 16, 8).unwrap();
            b.iter(|| {
                let p = varena.alloc(count).unwrap();
                varena.free(black_box(p), count);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_churn,
    bench_slab_growth,
    bench_varena_dispatch
);
criterion_main!(benches);
