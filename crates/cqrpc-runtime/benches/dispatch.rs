//! Benchmark: completion queue round trip
//!
//! Measures arm → complete → try_next → dispatch on a single queue with
//! no worker threads involved, and the same round trip through a running
//! scheduler with one worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cqrpc_core::{ActiveObject, Event, EventObserver, EventType, Tag, TransientEvent};
use cqrpc_runtime::{CompletionQueue, Scheduler, SchedulerConfig};

struct Noop;

impl Event for Noop {
    fn handle(&self, ok: bool) {
        black_box(ok);
    }

    fn event_type(&self) -> EventType {
        EventType::Write
    }
}

struct Counter(AtomicU64);

impl EventObserver for Counter {
    fn on_event(&self, _ok: bool, _ty: EventType) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

fn bench_inline_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_dispatch");
    let cq = CompletionQueue::new(0, Duration::from_millis(10));

    group.bench_function("owned_tag", |b| {
        b.iter(|| {
            cq.arm(Tag::owned(Noop)).unwrap().complete(true);
            cq.try_next().unwrap().dispatch();
        });
    });

    let observer = Arc::new(Counter(AtomicU64::new(0)));
    group.bench_function("transient_event", |b| {
        b.iter(|| {
            let obs: Arc<dyn EventObserver> = observer.clone();
            cq.arm(TransientEvent::tag(EventType::Finish, obs))
                .unwrap()
                .complete(true);
            cq.try_next().unwrap().dispatch();
        });
    });

    for batch in [16usize, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &n| {
            b.iter(|| {
                let ops: Vec<_> = (0..n).map(|_| cq.arm(Tag::owned(Noop)).unwrap()).collect();
                for op in ops {
                    op.complete(true);
                }
                while let Some(c) = cq.try_next() {
                    c.dispatch();
                }
            });
        });
    }
    group.finish();
}

fn bench_worker_dispatch(c: &mut Criterion) {
    let config = SchedulerConfig::new().num_queues(1).worker_threads(1);
    let sched = Scheduler::new(config).unwrap();
    sched.activate().unwrap();
    let counter = Arc::new(Counter(AtomicU64::new(0)));

    c.bench_function("worker_round_trip", |b| {
        b.iter(|| {
            let before = counter.0.load(Ordering::Acquire);
            let obs: Arc<dyn EventObserver> = counter.clone();
            sched
                .queue(0)
                .arm(TransientEvent::tag(EventType::Read, obs))
                .unwrap()
                .complete(true);
            while counter.0.load(Ordering::Acquire) == before {
                std::hint::spin_loop();
            }
        });
    });

    sched.deactivate();
    sched.wait().unwrap();
}

criterion_group!(benches, bench_inline_dispatch, bench_worker_dispatch);
criterion_main!(benches);
