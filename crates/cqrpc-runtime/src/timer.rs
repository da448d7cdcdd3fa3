//! Deadline timer service
//!
//! A single timer thread owns a min-heap of deadlines. Scheduling an
//! alarm parks a [`PendingOp`] here; on expiry the op completes with
//! `ok = true`, on cancellation (or service shutdown) with `ok = false`.
//! The resulting event runs on the op's completion queue like any other.
//!
//! # Cancellation Strategy
//!
//! Lazy: `cancel` removes the op from the armed map and leaves the heap
//! entry behind; the timer thread skips entries whose op is gone. Once
//! stale entries outnumber live ones the heap is rebuilt from the armed
//! set, so short calls with long deadlines do not pile up entries.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cqrpc_core::{
    kdebug, kerror, kwarn, ActiveObject, Lifecycle, LifecycleState, MetricsWriter, RpcResult,
    Statistics, WorkerError,
};

use crate::completion_queue::PendingOp;

/// Heap size below which stale entries are never pruned
const PRUNE_MIN_ENTRIES: usize = 64;

/// Handle for cancelling a scheduled alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

impl TimerHandle {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Heap entry, earliest deadline first
struct HeapEntry {
    deadline: Instant,
    handle: TimerHandle,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap; tie-break by handle for determinism
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.handle.0.cmp(&self.handle.0),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<HeapEntry>,
    armed: HashMap<TimerHandle, PendingOp>,
    running: bool,
    total_scheduled: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl TimerState {
    /// Drop cancelled entries once they make up most of the heap.
    fn prune(&mut self) {
        let live = self.armed.len();
        if self.heap.len() <= PRUNE_MIN_ENTRIES || self.heap.len() <= 2 * live {
            return;
        }
        let armed = &self.armed;
        self.heap.retain(|entry| armed.contains_key(&entry.handle));
    }
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

pub struct TimerService {
    name: String,
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Lifecycle,
}

impl TimerService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState::default()),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Complete `op` with `true` at `deadline`.
    ///
    /// If the service is not running the op completes with `false` at once.
    pub fn schedule(&self, deadline: Instant, op: PendingOp) -> TimerHandle {
        let handle = TimerHandle::next();
        let mut state = self.shared.state.lock().unwrap();
        if !state.running {
            drop(state);
            kwarn!("{}: alarm scheduled while stopped", self.name);
            op.complete(false);
            return handle;
        }

        let earliest = state.heap.peek().map_or(true, |top| deadline < top.deadline);
        state.heap.push(HeapEntry { deadline, handle });
        state.armed.insert(handle, op);
        state.total_scheduled += 1;
        drop(state);

        if earliest {
            self.shared.cond.notify_one();
        }
        handle
    }

    pub fn schedule_after(&self, delay: Duration, op: PendingOp) -> TimerHandle {
        self.schedule(Instant::now() + delay, op)
    }

    /// Cancel an alarm. True if it had not fired yet.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let op = {
            let mut state = self.shared.state.lock().unwrap();
            let op = state.armed.remove(&handle);
            if op.is_some() {
                state.total_cancelled += 1;
                state.prune();
            }
            op
        };
        match op {
            Some(op) => {
                op.complete(false);
                true
            }
            None => false,
        }
    }

    /// Alarms waiting to fire.
    pub fn armed(&self) -> usize {
        self.shared.state.lock().unwrap().armed.len()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.shared.state.lock().unwrap().heap.len()
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if !state.running {
            break;
        }

        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(top) = state.heap.peek() {
            if top.deadline > now {
                break;
            }
            let handle = top.handle;
            state.heap.pop();
            if let Some(op) = state.armed.remove(&handle) {
                expired.push(op);
            }
        }

        if !expired.is_empty() {
            state.total_fired += expired.len() as u64;
            drop(state);
            for op in expired {
                op.complete(true);
            }
            state = shared.state.lock().unwrap();
            continue;
        }

        if state.armed.is_empty() {
            // Only stale cancelled entries left
            state.heap.clear();
        }

        state = match state.heap.peek() {
            Some(top) => {
                let wait = top.deadline.saturating_duration_since(now);
                shared.cond.wait_timeout(state, wait).unwrap().0
            }
            None => shared.cond.wait(state).unwrap(),
        };
    }

    // Stopped: every unfired alarm completes as cancelled
    let leftover: Vec<PendingOp> = state.armed.drain().map(|(_, op)| op).collect();
    state.total_cancelled += leftover.len() as u64;
    state.heap.clear();
    drop(state);
    for op in leftover {
        op.complete(false);
    }
}

impl ActiveObject for TimerService {
    fn activate(&self) -> RpcResult<()> {
        self.lifecycle.begin_activate()?;
        self.shared.state.lock().unwrap().running = true;

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || timer_loop(shared))
        {
            Ok(handle) => {
                *self.thread.lock().unwrap() = Some(handle);
                kdebug!("{}: started", self.name);
                Ok(())
            }
            Err(e) => {
                kerror!("{}: failed to spawn timer thread: {}", self.name, e);
                self.shared.state.lock().unwrap().running = false;
                self.lifecycle.reset();
                Err(WorkerError::SpawnFailed.into())
            }
        }
    }

    fn deactivate(&self) {
        if self.lifecycle.begin_deactivate() {
            self.shared.state.lock().unwrap().running = false;
            self.shared.cond.notify_all();
        }
    }

    fn wait(&self) -> RpcResult<()> {
        if !self.lifecycle.check_wait()? {
            return Ok(());
        }
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                kerror!("{}: timer thread panicked", self.name);
            }
        }
        self.lifecycle.finish_wait();
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

impl Statistics for TimerService {
    fn write(&self, w: &mut dyn MetricsWriter) {
        let state = self.shared.state.lock().unwrap();
        let labels = [("timer", self.name.as_str())];
        w.gauge("cqrpc_timer_armed", &labels, state.armed.len() as i64);
        w.counter("cqrpc_timer_scheduled_total", &labels, state.total_scheduled);
        w.counter("cqrpc_timer_fired_total", &labels, state.total_fired);
        w.counter("cqrpc_timer_cancelled_total", &labels, state.total_cancelled);
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.deactivate();
        let _ = self.wait();
    }
}
