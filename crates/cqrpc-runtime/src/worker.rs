//! Worker thread management
//!
//! Each worker drains one completion queue until that queue reports
//! shutdown with nothing outstanding. Worker `i` serves queue
//! `i % num_queues`, so several workers may share a queue.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cqrpc_core::kprint;
use cqrpc_core::{kdebug, kerror, RpcResult, WorkerError};

use crate::completion_queue::CompletionQueue;

/// Counters shared by all workers of a scheduler.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub panics: AtomicU64,
}

/// Pool of worker threads
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads named `{name}-{i}`.
    ///
    /// On spawn failure the queues are shut down, already-started workers
    /// are joined and `SpawnFailed` is returned.
    pub fn start(
        name: &str,
        num_workers: usize,
        queues: &[Arc<CompletionQueue>],
        stats: &Arc<WorkerStats>,
    ) -> RpcResult<Self> {
        let mut pool = WorkerPool {
            handles: Vec::with_capacity(num_workers),
        };

        for i in 0..num_workers {
            let cq = Arc::clone(&queues[i % queues.len()]);
            let stats = Arc::clone(stats);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(i, cq, stats));

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    kerror!("failed to spawn worker {}: {}", i, e);
                    for q in queues {
                        q.shutdown();
                    }
                    pool.join();
                    return Err(WorkerError::SpawnFailed.into());
                }
            }
        }
        Ok(pool)
    }

    /// Wait for all workers to finish
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                kerror!("worker thread exited by panic");
            }
        }
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }
}

fn worker_loop(worker_id: usize, cq: Arc<CompletionQueue>, stats: Arc<WorkerStats>) {
    kprint::set_worker_id(worker_id);
    kdebug!("worker {} serving queue {}", worker_id, cq.index());

    while let Some(completion) = cq.next() {
        let ty = completion.event_type();
        let ok = completion.ok();
        // Handler bugs stay inside the call that raised them
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || completion.dispatch())) {
            stats.panics.fetch_add(1, Ordering::Relaxed);
            kerror!(
                "{:?} handler panicked (ok={}): {}",
                ty,
                ok,
                panic_message(payload.as_ref())
            );
        }
    }

    kdebug!("worker {} exiting", worker_id);
    kprint::clear_worker_id();
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let p = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(p.as_ref()), "static");
        let p = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(p.as_ref()), "formatted 7");
    }
}
