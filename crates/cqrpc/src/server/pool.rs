//! Registry of live calls
//!
//! The pool owns every accepted call until it unregisters itself on
//! completion, and coordinates shutdown:
//!
//! ```text
//!   deactivate ──► state = Deactivating (under the members lock)
//!              ──► snapshot members ──► stop() each, lock released
//!
//!   wait ──► loop { all members stopped? ──► done
//!                   else sleep on StopSignal (bounded) }
//! ```
//!
//! Members notify the [`StopSignal`] on their stop transition, so `wait`
//! wakes as soon as the last one flips. The bounded re-check covers
//! members that never notify.
//!
//! Admission shares the critical section that flips the state: a call
//! added after `deactivate` is stopped immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use cqrpc_core::{
    kdebug, ActiveObject, CallId, Lifecycle, LifecycleState, MetricsWriter, RpcResult, Statistics,
};

/// Re-check interval for members that stop without notifying.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A pool member.
pub trait PooledCall: Send + Sync {
    fn id(&self) -> CallId;

    /// Request cancellation. Idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// Generation counter bumped whenever a member stops or leaves.
#[derive(Debug, Default)]
pub struct StopSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    /// Sleep while the generation is still `seen`, at most `timeout`.
    fn wait_change(&self, seen: u64, timeout: Duration) {
        let guard = self.generation.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout_while(guard, timeout, |g| *g == seen)
            .unwrap();
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    added: AtomicU64,
    removed: AtomicU64,
    rejected: AtomicU64,
}

pub struct RpcPool {
    name: &'static str,
    members: Mutex<HashMap<CallId, Arc<dyn PooledCall>>>,
    lifecycle: Lifecycle,
    signal: Arc<StopSignal>,
    recheck: Duration,
    counters: PoolCounters,
}

impl RpcPool {
    pub fn new(name: &'static str) -> Self {
        Self::with_recheck(name, RECHECK_INTERVAL)
    }

    pub fn with_recheck(name: &'static str, recheck: Duration) -> Self {
        Self {
            name,
            members: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
            signal: Arc::new(StopSignal::new()),
            recheck,
            counters: PoolCounters::default(),
        }
    }

    /// Signal members notify when they stop.
    pub fn stop_signal(&self) -> &Arc<StopSignal> {
        &self.signal
    }

    /// Register a call. Returns false if the pool is not active, in
    /// which case the call has already been told to stop.
    pub fn add(&self, call: Arc<dyn PooledCall>) -> bool {
        let admitted = {
            let mut members = self.members.lock().unwrap();
            members.insert(call.id(), Arc::clone(&call));
            self.lifecycle.is_active()
        };
        self.counters.added.fetch_add(1, Ordering::Relaxed);
        if !admitted {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            kdebug!("{}: {} arrived during drain, stopping", self.name, call.id());
            call.stop();
        }
        admitted
    }

    /// Unregister a call. Called by the call itself once it is over.
    pub fn remove(&self, id: CallId) -> bool {
        let removed = self.members.lock().unwrap().remove(&id).is_some();
        if removed {
            self.counters.removed.fetch_add(1, Ordering::Relaxed);
            self.signal.notify();
        }
        removed
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.members.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all_stopped(&self) -> bool {
        self.members
            .lock()
            .unwrap()
            .values()
            .all(|call| call.is_stopped())
    }

    /// Like `wait`, bounded by `timeout`. True once every member has
    /// stopped; false on timeout or if the pool was never deactivated.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        match self.lifecycle.check_wait() {
            Ok(true) => {}
            Ok(false) => return true,
            Err(_) => return false,
        }
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.signal.generation();
            if self.all_stopped() {
                self.lifecycle.finish_wait();
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.signal.wait_change(seen, self.recheck.min(deadline - now));
        }
    }
}

impl ActiveObject for RpcPool {
    fn activate(&self) -> RpcResult<()> {
        let _members = self.members.lock().unwrap();
        self.lifecycle.begin_activate()
    }

    fn deactivate(&self) {
        let snapshot: Vec<Arc<dyn PooledCall>> = {
            let members = self.members.lock().unwrap();
            if !self.lifecycle.begin_deactivate() {
                return;
            }
            members.values().cloned().collect()
        };
        kdebug!("{}: stopping {} calls", self.name, snapshot.len());
        for call in snapshot {
            call.stop();
        }
    }

    fn wait(&self) -> RpcResult<()> {
        if !self.lifecycle.check_wait()? {
            return Ok(());
        }
        loop {
            let seen = self.signal.generation();
            if self.all_stopped() {
                break;
            }
            self.signal.wait_change(seen, self.recheck);
        }
        kdebug!("{}: drained", self.name);
        self.lifecycle.finish_wait();
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

impl Statistics for RpcPool {
    fn write(&self, w: &mut dyn MetricsWriter) {
        let labels = [("pool", self.name)];
        w.gauge("cqrpc_pool_calls", &labels, self.len() as i64);
        w.counter(
            "cqrpc_pool_added_total",
            &labels,
            self.counters.added.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_pool_removed_total",
            &labels,
            self.counters.removed.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_pool_rejected_total",
            &labels,
            self.counters.rejected.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::RpcError;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Acknowledges stop() but only reports stopped once flipped.
    struct MockCall {
        id: CallId,
        stop_requested: AtomicBool,
        stopped: AtomicBool,
        signal: Arc<StopSignal>,
    }

    impl MockCall {
        fn new(pool: &RpcPool) -> Arc<Self> {
            Arc::new(Self {
                id: CallId::next(),
                stop_requested: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                signal: Arc::clone(pool.stop_signal()),
            })
        }

        fn flip(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            self.signal.notify();
        }
    }

    impl PooledCall for MockCall {
        fn id(&self) -> CallId {
            self.id
        }

        fn stop(&self) {
            self.stop_requested.store(true, Ordering::SeqCst);
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_drain_waits_for_every_member() {
        // Long recheck so only the signal can wake wait() promptly
        let pool = Arc::new(RpcPool::with_recheck("test", Duration::from_secs(10)));
        pool.activate().unwrap();
        let calls: Vec<_> = (0..3).map(|_| MockCall::new(&pool)).collect();
        for call in &calls {
            assert!(pool.add(call.clone()));
        }

        pool.deactivate();
        assert!(calls.iter().all(|c| c.stop_requested.load(Ordering::SeqCst)));

        let flipper = {
            let calls = calls.clone();
            thread::spawn(move || {
                let mut last = Instant::now();
                for call in &calls {
                    thread::sleep(Duration::from_millis(30));
                    last = Instant::now();
                    call.flip();
                }
                last
            })
        };

        pool.wait().unwrap();
        let returned = Instant::now();
        let last_flip = flipper.join().unwrap();

        assert!(calls.iter().all(|c| c.is_stopped()));
        assert!(returned >= last_flip);
        assert!(returned.duration_since(last_flip) < Duration::from_secs(1));
        assert_eq!(pool.state(), LifecycleState::NotActive);
    }

    #[test]
    fn test_late_arrival_is_stopped() {
        let pool = RpcPool::new("test");
        pool.activate().unwrap();
        pool.deactivate();

        let late = MockCall::new(&pool);
        assert!(!pool.add(late.clone()));
        assert!(late.stop_requested.load(Ordering::SeqCst));
        assert!(pool.contains(late.id));

        late.flip();
        pool.wait().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let pool = RpcPool::new("test");
        pool.activate().unwrap();
        let call = MockCall::new(&pool);
        pool.add(call.clone());

        assert!(!pool.wait_for(Duration::from_millis(10)));
        pool.deactivate();
        assert!(!pool.wait_for(Duration::from_millis(20)));

        assert!(pool.remove(call.id));
        assert!(!pool.remove(call.id));
        assert!(pool.wait_for(Duration::from_millis(20)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lifecycle_misuse() {
        let pool = RpcPool::new("test");
        pool.activate().unwrap();
        assert_eq!(pool.activate(), Err(RpcError::AlreadyActive));
        assert_eq!(pool.wait(), Err(RpcError::StillActive));
        pool.deactivate();
        pool.wait().unwrap();
    }

    #[test]
    fn test_statistics() {
        let pool = RpcPool::new("calls");
        pool.activate().unwrap();
        let call = MockCall::new(&pool);
        pool.add(call.clone());
        let text = cqrpc_core::stats::render_prometheus(&pool);
        assert!(text.contains("cqrpc_pool_calls{pool=\"calls\"} 1"));
        assert!(text.contains("cqrpc_pool_added_total{pool=\"calls\"} 1"));
    }
}
