// I/O queue submit/reap throughput benchmarks.
//
// These exercise the free-pool backpressure path and the pending/ready
// handoff under a realistic close() workload, without touching the
// filesystem beyond descriptors that are immediately valid to close.

use criterion::{Criterion, criterion_group, criterion_main};
use oxidex_ioq::Ioq;
use std::ptr;

/// Submit-then-reap a batch of `close` requests on an already-warm queue.
fn bench_close_round_trip(c: &mut Criterion) {
    let ioq = Ioq::create(64, 4);

    c.bench_function("ioq_close_round_trip", |b| {
        b.iter(|| {
            for _ in 0..64 {
                ioq.close(-1, ptr::null_mut()).unwrap();
            }
            for _ in 0..64 {
                let ent = ioq.pop().unwrap();
                ioq.free(ent);
            }
        });
    });
}

/// Measure throughput at a shallow free pool, where submitters regularly
/// have to wait on reaping before they can submit more.
fn bench_shallow_pool_backpressure(c: &mut Criterion) {
    let ioq = Ioq::create(4, 2);

    c.bench_function("ioq_shallow_pool_backpressure", |b| {
        b.iter(|| {
            for _ in 0..256 {
                loop {
                    if ioq.close(-1, ptr::null_mut()).is_ok() {
                        break;
                    }
                    if let Some(ent) = ioq.trypop() {
                        ioq.free(ent);
                    }
                }
            }
            while ioq.capacity() < 4 {
                if let Some(ent) = ioq.pop() {
                    ioq.free(ent);
                }
            }
        });
    });
}

criterion_group!(benches, bench_close_round_trip, bench_shallow_pool_backpressure);
criterion_main!(benches);
