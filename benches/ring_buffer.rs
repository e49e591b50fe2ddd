use astro_capture::ring::{OverflowPolicy, RingBuffer};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn benchmark_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_dequeue");

    // Mono 8-bit frames from small ROI up to a 1280x960 sensor
    for size in [64 * 48, 640 * 480, 1280 * 960].iter() {
        let ring = RingBuffer::<u8>::new(8, *size, OverflowPolicy::Reject).unwrap();
        let frame = vec![0x5Au8; *size];

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("frame_bytes", size), &frame, |b, frame| {
            b.iter(|| {
                let mut slot = ring.acquire_write_slot().unwrap();
                slot.copy_from_slice(black_box(frame));
                slot.finalize();

                let read = ring.dequeue().unwrap();
                black_box(read[0]);
            });
        });
    }

    group.finish();
}

fn benchmark_overwrite_when_full(c: &mut Criterion) {
    let ring = RingBuffer::<u8>::new(4, 4096, OverflowPolicy::Overwrite).unwrap();

    c.bench_function("overwrite_full_ring", |b| {
        b.iter(|| {
            let mut slot = ring.acquire_write_slot().unwrap();
            slot[0] = black_box(1);
            black_box(slot.finalize())
        });
    });
}

fn benchmark_peek_last(c: &mut Criterion) {
    let ring = RingBuffer::<u8>::new(4, 640 * 480, OverflowPolicy::Overwrite).unwrap();
    ring.acquire_write_slot().unwrap().finalize();

    c.bench_function("peek_last", |b| {
        b.iter(|| black_box(ring.peek_last().map(|view| view.sequence())));
    });
}

criterion_group!(
    benches,
    benchmark_enqueue_dequeue,
    benchmark_overwrite_when_full,
    benchmark_peek_last
);
criterion_main!(benches);
