//! Scheduler: completion queues plus the workers that drain them
//!
//! ```text
//!        next_queue() round-robin
//!   call ─────────────┬──────────────┐
//!                     ▼              ▼
//!               [queue 0]       [queue 1]
//!                │     │         │     │
//!              w-0   w-2       w-1   w-3      worker i serves queue i % N
//! ```
//!
//! A call keeps the queue it was assigned for its whole life. Shutdown
//! signals every queue, then joins every worker, so no event handler
//! runs after the scheduler is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cqrpc_core::{
    kdebug, kinfo, kprint, ActiveObject, Lifecycle, LifecycleState, MetricsWriter, RpcError,
    RpcResult, Statistics,
};

use crate::completion_queue::CompletionQueue;
use crate::config::SchedulerConfig;
use crate::worker::{WorkerPool, WorkerStats};

pub struct Scheduler {
    config: SchedulerConfig,
    queues: Vec<Arc<CompletionQueue>>,
    num_workers: usize,
    workers: Mutex<Option<WorkerPool>>,
    lifecycle: Lifecycle,
    /// Queues are single-use; set once they have been shut down
    spent: AtomicBool,
    next_queue: AtomicUsize,
    stats: Arc<WorkerStats>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> RpcResult<Self> {
        config.validate()?;
        if config.debug_logging && kprint::log_level() < kprint::LogLevel::Debug {
            kprint::set_log_level(kprint::LogLevel::Debug);
        }

        let queues = (0..config.num_queues)
            .map(|i| CompletionQueue::new(i, config.park_timeout))
            .collect();
        let num_workers = config.resolved_workers();

        Ok(Self {
            config,
            queues,
            num_workers,
            workers: Mutex::new(None),
            lifecycle: Lifecycle::new(),
            spent: AtomicBool::new(false),
            next_queue: AtomicUsize::new(0),
            stats: Arc::new(WorkerStats::default()),
        })
    }

    /// Scheduler from `SchedulerConfig::from_env()`.
    pub fn from_env() -> RpcResult<Self> {
        Self::new(SchedulerConfig::from_env())
    }

    /// Queue by index (wrapped).
    #[inline]
    pub fn queue(&self, index: usize) -> &Arc<CompletionQueue> {
        &self.queues[index % self.queues.len()]
    }

    /// Next queue in round-robin order.
    #[inline]
    pub fn next_queue(&self) -> &Arc<CompletionQueue> {
        let i = self.next_queue.fetch_add(1, Ordering::Relaxed);
        self.queue(i)
    }

    pub fn queues(&self) -> &[Arc<CompletionQueue>] {
        &self.queues
    }

    #[inline]
    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Handler panics caught by workers so far.
    pub fn panics(&self) -> u64 {
        self.stats.panics.load(Ordering::Relaxed)
    }

    fn shutdown_queues(&self) {
        self.spent.store(true, Ordering::Release);
        for q in &self.queues {
            q.shutdown();
        }
    }
}

impl ActiveObject for Scheduler {
    fn activate(&self) -> RpcResult<()> {
        if self.spent.load(Ordering::Acquire) {
            return Err(RpcError::QueueShutdown);
        }
        self.lifecycle.begin_activate()?;

        match WorkerPool::start(
            &self.config.thread_name,
            self.num_workers,
            &self.queues,
            &self.stats,
        ) {
            Ok(pool) => {
                kinfo!(
                    "scheduler started: {} workers over {} queues",
                    pool.num_workers(),
                    self.queues.len()
                );
                *self.workers.lock().unwrap() = Some(pool);
                Ok(())
            }
            Err(e) => {
                self.spent.store(true, Ordering::Release);
                self.lifecycle.reset();
                Err(e)
            }
        }
    }

    fn deactivate(&self) {
        if self.lifecycle.begin_deactivate() {
            kdebug!("scheduler deactivating");
            self.shutdown_queues();
        }
    }

    fn wait(&self) -> RpcResult<()> {
        if !self.lifecycle.check_wait()? {
            return Ok(());
        }
        let pool = self.workers.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.join();
        }
        kdebug!("scheduler drained");
        self.lifecycle.finish_wait();
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

impl Statistics for Scheduler {
    fn write(&self, w: &mut dyn MetricsWriter) {
        for q in &self.queues {
            let idx = q.index().to_string();
            let labels = [("queue", idx.as_str())];
            w.counter("cqrpc_queue_armed_total", &labels, q.armed_total());
            w.counter("cqrpc_queue_dispatched_total", &labels, q.dispatched_total());
            w.counter("cqrpc_queue_failed_total", &labels, q.failed_total());
            w.gauge("cqrpc_queue_outstanding", &labels, q.outstanding() as i64);
        }
        w.gauge("cqrpc_workers", &[], self.num_workers as i64);
        w.counter("cqrpc_handler_panics_total", &[], self.panics());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.deactivate();
        let _ = self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::stats::render_prometheus;
    use cqrpc_core::{Event, EventType, Tag};
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Probe {
        id: usize,
        hits: Arc<Vec<AtomicUsize>>,
        threads: Arc<Mutex<HashSet<String>>>,
    }

    impl Event for Probe {
        fn handle(&self, _ok: bool) {
            self.hits[self.id].fetch_add(1, Ordering::SeqCst);
            if let Some(name) = thread::current().name() {
                self.threads.lock().unwrap().insert(name.to_string());
            }
        }

        fn event_type(&self) -> EventType {
            EventType::Read
        }
    }

    fn config(queues: usize, workers: usize) -> SchedulerConfig {
        SchedulerConfig::new()
            .num_queues(queues)
            .worker_threads(workers)
            .park_timeout(Duration::from_millis(5))
    }

    #[test]
    fn test_thousand_events_each_handled_once() {
        let sched = Arc::new(Scheduler::new(config(2, 4)).unwrap());
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
        let threads = Arc::new(Mutex::new(HashSet::new()));

        let ops: Vec<_> = (0..1000)
            .map(|id| {
                let tag = Tag::owned(Probe {
                    id,
                    hits: Arc::clone(&hits),
                    threads: Arc::clone(&threads),
                });
                sched.next_queue().arm(tag).unwrap()
            })
            .collect();

        sched.activate().unwrap();

        // Complete from another thread while shutdown is already underway
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for (i, op) in ops.into_iter().enumerate() {
                op.complete(i % 7 != 0);
            }
        });

        sched.deactivate();
        sched.wait().unwrap();
        completer.join().unwrap();

        for (i, h) in hits.iter().enumerate() {
            assert_eq!(h.load(Ordering::SeqCst), 1, "event {} handled wrong count", i);
        }
        assert!(threads.lock().unwrap().iter().all(|n| n.starts_with("cqrpc-worker-")));
        assert_eq!(sched.state(), LifecycleState::NotActive);
    }

    #[test]
    fn test_round_robin_assignment() {
        let sched = Scheduler::new(config(3, 3)).unwrap();
        let order: Vec<usize> = (0..6).map(|_| sched.next_queue().index()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(sched.queue(4).index(), 1);
    }

    #[test]
    fn test_lifecycle_misuse() {
        let sched = Scheduler::new(config(1, 1)).unwrap();
        assert_eq!(sched.wait(), Ok(()));
        sched.activate().unwrap();
        assert_eq!(sched.activate(), Err(RpcError::AlreadyActive));
        assert_eq!(sched.wait(), Err(RpcError::StillActive));
        sched.deactivate();
        sched.wait().unwrap();
        assert_eq!(sched.activate(), Err(RpcError::QueueShutdown));
    }

    #[test]
    fn test_panicking_handler_does_not_kill_worker() {
        struct Boom;
        impl Event for Boom {
            fn handle(&self, _ok: bool) {
                panic!("application bug");
            }
            fn event_type(&self) -> EventType {
                EventType::Finish
            }
        }

        let sched = Scheduler::new(config(1, 1)).unwrap();
        sched.activate().unwrap();
        let q = sched.queue(0);
        q.arm(Tag::owned(Boom)).unwrap().complete(true);

        let hits: Arc<Vec<AtomicUsize>> = Arc::new(vec![AtomicUsize::new(0)]);
        let tag = Tag::owned(Probe {
            id: 0,
            hits: Arc::clone(&hits),
            threads: Arc::new(Mutex::new(HashSet::new())),
        });
        q.arm(tag).unwrap().complete(true);

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits[0].load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(hits[0].load(Ordering::SeqCst), 1);
        assert_eq!(sched.panics(), 1);

        let text = render_prometheus(&sched);
        assert!(text.contains("cqrpc_handler_panics_total 1"));
        assert!(text.contains("cqrpc_queue_dispatched_total{queue=\"0\"}"));
    }

    #[test]
    fn test_debug_logging_raises_level() {
        let _sched = Scheduler::new(config(1, 1).debug_logging(true)).unwrap();
        assert!(kprint::log_level() >= kprint::LogLevel::Debug);
    }
}
