//! Benchmarks for event bus operations.
//!
//! Run with: cargo bench --bench bus

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventgate::bus::{BusMessage, EventBus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn message(id: u64) -> BusMessage {
    BusMessage::new("sensors.temperature", format!("{{\"id\":{id},\"value\":21.5}}"))
}

fn bench_publish_no_handlers(c: &mut Criterion) {
    let bus = EventBus::new();

    c.bench_function("bus/publish_no_handlers", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            black_box(bus.publish(message(id)))
        })
    });
}

fn bench_publish_with_handlers(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus/publish_with_handlers");

    for handlers in [1usize, 10, 100] {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));
        for _ in 0..handlers {
            let seen = seen.clone();
            bus.register("sensors.temperature", move |_: BusMessage| {
                seen.fetch_add(1, Ordering::Relaxed);
            });
        }

        group.throughput(Throughput::Elements(handlers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(handlers), &handlers, |b, _| {
            let mut id = 0u64;
            b.iter(|| {
                id += 1;
                black_box(bus.publish(message(id)))
            })
        });
    }

    group.finish();
}

fn bench_send_round_robin(c: &mut Criterion) {
    let bus = EventBus::new();
    for _ in 0..8 {
        bus.register("workers", |_: BusMessage| {});
    }

    c.bench_function("bus/send_round_robin", |b| {
        b.iter(|| black_box(bus.send(BusMessage::new("workers", "job"))))
    });
}

fn bench_register_unregister(c: &mut Criterion) {
    let bus = EventBus::new();
    // Existing subscribers make every write copy a larger snapshot
    for _ in 0..100 {
        bus.register("news", |_: BusMessage| {});
    }

    c.bench_function("bus/register_unregister", |b| {
        b.iter(|| {
            let id = bus.register("news", |_: BusMessage| {});
            black_box(bus.unregister("news", id))
        })
    });
}

fn bench_request_reply(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let bus = EventBus::new();
    let replier = bus.clone();
    bus.register("echo", move |msg: BusMessage| {
        replier.reply(&msg, msg.body.clone());
    });

    c.bench_function("bus/request_reply", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    bus.request(BusMessage::new("echo", "ping"), Duration::from_secs(1))
                        .await
                        .unwrap(),
                )
            })
        })
    });
}

fn bench_concurrent_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("bus/concurrent_publish", |b| {
        let bus = EventBus::new();
        bus.register("sensors.temperature", |_: BusMessage| {});

        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();

                for t in 0..4u64 {
                    let bus = Arc::clone(&bus);
                    handles.push(tokio::spawn(async move {
                        for i in 0..100 {
                            bus.publish(message(t * 100 + i));
                        }
                    }));
                }

                for h in handles {
                    h.await.unwrap();
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_publish_no_handlers,
    bench_publish_with_handlers,
    bench_send_round_robin,
    bench_register_unregister,
    bench_request_reply,
    bench_concurrent_publish,
);
criterion_main!(benches);
