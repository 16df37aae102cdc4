//! Throughput of the bounded blocking SPMC queue backing the logging
//! sinks, ported from `original_source/NIOMan/Classes/log/thrqueue.c`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relayforge::queue::Queue;
use std::sync::Arc;
use std::thread;

fn single_thread_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_single_thread");

    for &capacity in &[64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue_nb", capacity), &capacity, |b, &capacity| {
            let q: Queue<u64> = Queue::new(capacity);
            b.iter(|| {
                q.enqueue_nb(black_box(1)).unwrap();
                black_box(q.dequeue_nb());
            });
        });
    }
    group.finish();
}

fn spmc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_spmc");

    for &consumers in &[1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::new("consumers", consumers), &consumers, |b, &consumers| {
            b.iter(|| {
                let q = Arc::new(Queue::<u64>::new(256));
                let handles: Vec<_> = (0..consumers)
                    .map(|_| {
                        let q = q.clone();
                        thread::spawn(move || {
                            let mut n = 0u64;
                            while n < 1000 {
                                if q.dequeue_nb().is_some() {
                                    n += 1;
                                }
                            }
                        })
                    })
                    .collect();

                for i in 0..(1000 * consumers as u64) {
                    while q.enqueue_nb(i).is_err() {
                        thread::yield_now();
                    }
                }
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, single_thread_enqueue_dequeue, spmc_throughput);
criterion_main!(benches);
