use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kafkagate::consumer::OffsetTracker;

const ACKS: i64 = 10_000;

fn benchmark_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("offset_tracker");
    group.throughput(Throughput::Elements(ACKS as u64));

    // gap 1 is the dense fast path where the base simply advances; larger
    // gaps exercise the sparse range bookkeeping.
    for gap in [1i64, 2, 16] {
        group.bench_with_input(BenchmarkId::new("ack", gap), &gap, |b, &gap| {
            b.iter(|| {
                let mut tracker = OffsetTracker::new(0);
                for i in 0..ACKS {
                    tracker.ack(i * gap);
                }
                tracker.committable()
            });
        });
    }

    group.bench_function("restore", |b| {
        let mut tracker = OffsetTracker::new(0);
        for i in 0..ACKS {
            tracker.ack(i * 2);
        }
        let (offset, metadata) = tracker.committable();
        b.iter(|| OffsetTracker::restore(offset, &metadata).unwrap());
    });

    group.finish();
}

criterion_group!(benches, benchmark_tracker);
criterion_main!(benches);
