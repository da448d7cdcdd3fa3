//! Completion queue
//!
//! Asynchronous operations are submitted by arming a [`Tag`], which yields
//! a [`PendingOp`]. Whoever performs the operation (a transport, the timer
//! service) completes it with `ok`; workers drain `(tag, ok)` pairs with
//! [`CompletionQueue::next`] and dispatch them.
//!
//! ```text
//!   arm(tag) ──► PendingOp ──► transport ──► complete(ok) ──┐
//!      │                                                     ▼
//!      │ outstanding += 1                           ready: SegQueue<(Tag, ok)>
//!      │                                                     │
//!      └──────── outstanding -= 1 ◄── Completion drop ◄── next() on a worker
//! ```
//!
//! `outstanding` counts armed operations that have not finished dispatch,
//! with the shutdown flag folded into its top bit. `next()` returns `None`
//! only when the queue is shut down and that count is zero, so no
//! operation armed before the drain can be lost. Once drained, `arm()`
//! fails with `QueueShutdown`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use cqrpc_core::{kdebug, EventType, RpcError, RpcResult, Tag};

use crate::parking::{new_parking, WorkerParking};

const SHUTDOWN_BIT: usize = 1 << (usize::BITS - 1);

pub struct CompletionQueue {
    index: usize,
    ready: SegQueue<(Tag, bool)>,
    outstanding: AtomicUsize,
    parking: Box<dyn WorkerParking>,
    park_timeout: Duration,
    armed_total: AtomicU64,
    dispatched_total: AtomicU64,
    failed_total: AtomicU64,
}

impl CompletionQueue {
    pub fn new(index: usize, park_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            index,
            ready: SegQueue::new(),
            outstanding: AtomicUsize::new(0),
            parking: new_parking(),
            park_timeout,
            armed_total: AtomicU64::new(0),
            dispatched_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Register an outstanding operation for `tag`.
    pub fn arm(self: &Arc<Self>, tag: Tag) -> RpcResult<PendingOp> {
        let mut cur = self.outstanding.load(Ordering::Acquire);
        loop {
            if cur == SHUTDOWN_BIT {
                return Err(RpcError::QueueShutdown);
            }
            match self.outstanding.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.armed_total.fetch_add(1, Ordering::Relaxed);
        Ok(PendingOp {
            cq: Arc::clone(self),
            tag: Some(tag),
        })
    }

    fn post(&self, tag: Tag, ok: bool) {
        if !ok {
            self.failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.push((tag, ok));
        self.parking.wake_one();
    }

    /// Block until a completion is ready. `None` once shut down and drained.
    pub fn next(&self) -> Option<Completion<'_>> {
        loop {
            if let Some(c) = self.try_next() {
                return Some(c);
            }
            if self.is_drained() {
                // Let sibling workers observe the drain too
                self.parking.wake_all();
                return None;
            }
            self.parking.park(Some(self.park_timeout));
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&self) -> Option<Completion<'_>> {
        self.ready.pop().map(|(tag, ok)| Completion {
            tag: Some(tag),
            ok,
            cq: self,
        })
    }

    fn retire(&self) {
        self.dispatched_total.fetch_add(1, Ordering::Relaxed);
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if prev == SHUTDOWN_BIT | 1 {
            kdebug!("queue {} drained", self.index);
            self.parking.wake_all();
        }
    }

    /// Stop accepting work once everything outstanding has been dispatched.
    pub fn shutdown(&self) {
        let prev = self.outstanding.fetch_or(SHUTDOWN_BIT, Ordering::AcqRel);
        if prev & SHUTDOWN_BIT == 0 {
            kdebug!(
                "queue {} shutting down, {} outstanding",
                self.index,
                prev & !SHUTDOWN_BIT
            );
        }
        self.parking.wake_all();
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) & SHUTDOWN_BIT != 0
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == SHUTDOWN_BIT
    }

    /// Armed operations not yet dispatched.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire) & !SHUTDOWN_BIT
    }

    pub fn armed_total(&self) -> u64 {
        self.armed_total.load(Ordering::Relaxed)
    }

    pub fn dispatched_total(&self) -> u64 {
        self.dispatched_total.load(Ordering::Relaxed)
    }

    /// Completions that arrived with `ok == false`.
    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("index", &self.index)
            .field("outstanding", &self.outstanding())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// An armed operation awaiting its completion.
///
/// Dropping it without calling [`complete`](Self::complete) completes it
/// with `ok == false`.
#[must_use = "dropping a PendingOp completes it with ok=false"]
pub struct PendingOp {
    cq: Arc<CompletionQueue>,
    tag: Option<Tag>,
}

impl PendingOp {
    pub fn complete(mut self, ok: bool) {
        if let Some(tag) = self.tag.take() {
            self.cq.post(tag, ok);
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.tag.as_ref().map(Tag::event_type)
    }

    pub fn queue_index(&self) -> usize {
        self.cq.index
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.cq.post(tag, false);
        }
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOp")
            .field("queue", &self.cq.index)
            .field("event", &self.event_type())
            .finish()
    }
}

/// A drained completion. Retires its operation when dropped, after
/// dispatch or during unwinding.
pub struct Completion<'a> {
    tag: Option<Tag>,
    ok: bool,
    cq: &'a CompletionQueue,
}

impl Completion<'_> {
    #[inline]
    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.tag.as_ref().map(Tag::event_type)
    }

    /// Run the event's `handle(ok)`.
    pub fn dispatch(mut self) {
        if let Some(tag) = self.tag.take() {
            tag.dispatch(self.ok);
        }
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        // Owned events are released before the count drops
        drop(self.tag.take());
        self.cq.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::Event;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Counting {
        hits: Arc<AtomicUsize>,
        oks: Arc<AtomicUsize>,
    }

    impl Event for Counting {
        fn handle(&self, ok: bool) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if ok {
                self.oks.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn event_type(&self) -> EventType {
            EventType::Write
        }
    }

    fn counting() -> (Tag, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let oks = Arc::new(AtomicUsize::new(0));
        let tag = Tag::owned(Counting {
            hits: Arc::clone(&hits),
            oks: Arc::clone(&oks),
        });
        (tag, hits, oks)
    }

    #[test]
    fn test_arm_complete_dispatch() {
        let cq = CompletionQueue::new(0, Duration::from_millis(10));
        let (tag, hits, oks) = counting();
        let op = cq.arm(tag).unwrap();
        assert_eq!(op.event_type(), Some(EventType::Write));
        assert_eq!(cq.outstanding(), 1);
        assert!(cq.try_next().is_none());

        op.complete(true);
        let c = cq.try_next().unwrap();
        assert!(c.ok());
        c.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(oks.load(Ordering::SeqCst), 1);
        assert_eq!(cq.outstanding(), 0);
        assert_eq!(cq.dispatched_total(), 1);
    }

    #[test]
    fn test_dropped_op_completes_false() {
        let cq = CompletionQueue::new(0, Duration::from_millis(10));
        let (tag, hits, oks) = counting();
        drop(cq.arm(tag).unwrap());

        cq.try_next().unwrap().dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(oks.load(Ordering::SeqCst), 0);
        assert_eq!(cq.failed_total(), 1);
    }

    #[test]
    fn test_shutdown_waits_for_outstanding() {
        let cq = CompletionQueue::new(0, Duration::from_millis(10));
        let (tag, hits, _) = counting();
        let op = cq.arm(tag).unwrap();

        cq.shutdown();
        assert!(cq.is_shutdown());
        assert!(!cq.is_drained());

        // Still accepting while work is outstanding
        let (tag2, hits2, _) = counting();
        let op2 = cq.arm(tag2).unwrap();

        let consumer = {
            let cq = Arc::clone(&cq);
            thread::spawn(move || {
                let mut n = 0;
                while let Some(c) = cq.next() {
                    c.dispatch();
                    n += 1;
                }
                n
            })
        };

        thread::sleep(Duration::from_millis(30));
        op.complete(true);
        op2.complete(false);

        assert_eq!(consumer.join().unwrap(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 1);
        assert!(cq.is_drained());

        let (tag3, _, _) = counting();
        assert_eq!(cq.arm(tag3).err(), Some(RpcError::QueueShutdown));
    }

    #[test]
    fn test_completion_retires_on_panic() {
        struct Boom;
        impl Event for Boom {
            fn handle(&self, _ok: bool) {
                panic!("handler bug");
            }
            fn event_type(&self) -> EventType {
                EventType::Read
            }
        }

        let cq = CompletionQueue::new(0, Duration::from_millis(10));
        cq.arm(Tag::owned(Boom)).unwrap().complete(true);
        let c = cq.try_next().unwrap();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || c.dispatch()));
        assert!(r.is_err());
        assert_eq!(cq.outstanding(), 0);
    }
}
