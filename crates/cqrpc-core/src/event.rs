//! Completion events
//!
//! An event correlates one submitted asynchronous operation back to the
//! call that submitted it. The completion queue hands each one back
//! exactly once as a [`Tag`] together with the `ok` flag.
//!
//! ```text
//!  arm(Tag) ──► transport ──► (Tag, ok) ──► worker ──► Tag::dispatch(ok)
//!                                                        │
//!                          Owned: handle(ok), then drop ◄┤
//!                          Shared: handle(ok), stays     ◄┘
//! ```
//!
//! Three flavours cover every call:
//!
//! - [`TransientEvent`]: one-shot, owns its observer (connection, finish).
//! - [`DirectionEvent`]: reused for the whole call, one per direction,
//!   tracks `is_pending`, weak observer.
//! - [`ObserverEvent`]: one-shot with a weak observer, silently dropped
//!   when the observer is gone (timeouts, drain notifications).

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connection,
    Start,
    Initialize,
    Read,
    Write,
    Finish,
    Stop,
    Done,
    Timeout,
}

impl EventType {
    /// Read and Write are the two single-outstanding directions.
    #[inline]
    pub fn is_direction(&self) -> bool {
        matches!(self, EventType::Read | EventType::Write)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connection => "connection",
            EventType::Start => "start",
            EventType::Initialize => "initialize",
            EventType::Read => "read",
            EventType::Write => "write",
            EventType::Finish => "finish",
            EventType::Stop => "stop",
            EventType::Done => "done",
            EventType::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completion tag's behaviour.
///
/// `handle` runs on whichever worker drained the completion. `ok == false`
/// means the operation did not complete normally (the call is ending);
/// it is ordinary input, not an error.
pub trait Event: Send + Sync {
    fn handle(&self, ok: bool);

    fn event_type(&self) -> EventType;
}

/// Receiver of routed events.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, ok: bool, ty: EventType);
}

/// What the completion queue carries.
pub enum Tag {
    /// Ownership returns to the dispatcher, which drops it after `handle`.
    Owned(Box<dyn Event>),
    /// Long-lived event shared with its call.
    Shared(Arc<dyn Event>),
}

impl Tag {
    pub fn owned<E: Event + 'static>(event: E) -> Self {
        Tag::Owned(Box::new(event))
    }

    pub fn shared(event: Arc<dyn Event>) -> Self {
        Tag::Shared(event)
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Tag::Owned(ev) => ev.event_type(),
            Tag::Shared(ev) => ev.event_type(),
        }
    }

    /// Hand the completion to its event, consuming the tag.
    #[inline]
    pub fn dispatch(self, ok: bool) {
        match self {
            Tag::Owned(ev) => ev.handle(ok),
            Tag::Shared(ev) => ev.handle(ok),
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Owned(ev) => write!(f, "Tag::Owned({})", ev.event_type()),
            Tag::Shared(ev) => write!(f, "Tag::Shared({})", ev.event_type()),
        }
    }
}

/// One-shot event that keeps its observer alive until handled.
pub struct TransientEvent {
    ty: EventType,
    observer: Arc<dyn EventObserver>,
}

impl TransientEvent {
    pub fn new(ty: EventType, observer: Arc<dyn EventObserver>) -> Self {
        Self { ty, observer }
    }

    pub fn tag(ty: EventType, observer: Arc<dyn EventObserver>) -> Tag {
        Tag::owned(Self::new(ty, observer))
    }
}

impl Event for TransientEvent {
    fn handle(&self, ok: bool) {
        self.observer.on_event(ok, self.ty);
    }

    fn event_type(&self) -> EventType {
        self.ty
    }
}

/// Long-lived per-direction event.
///
/// The owner calls [`mark_pending`](Self::mark_pending) before arming and
/// must not arm again while [`is_pending`](Self::is_pending) is true. The
/// flag clears before the observer runs so the observer may re-arm.
pub struct DirectionEvent {
    ty: EventType,
    pending: AtomicBool,
    observer: Weak<dyn EventObserver>,
}

impl DirectionEvent {
    pub fn new(ty: EventType, observer: Weak<dyn EventObserver>) -> Self {
        Self {
            ty,
            pending: AtomicBool::new(false),
            observer,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Claim the direction. False if an operation is already outstanding.
    #[inline]
    pub fn mark_pending(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    /// Clone this event into a queue tag.
    pub fn tag(self: &Arc<Self>) -> Tag {
        Tag::Shared(Arc::clone(self) as Arc<dyn Event>)
    }
}

impl Event for DirectionEvent {
    fn handle(&self, ok: bool) {
        self.pending.store(false, Ordering::Release);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_event(ok, self.ty);
        }
    }

    fn event_type(&self) -> EventType {
        self.ty
    }
}

/// One-shot event with a weak observer.
pub struct ObserverEvent {
    ty: EventType,
    observer: Weak<dyn EventObserver>,
}

impl ObserverEvent {
    pub fn new(ty: EventType, observer: Weak<dyn EventObserver>) -> Self {
        Self { ty, observer }
    }

    pub fn tag(ty: EventType, observer: Weak<dyn EventObserver>) -> Tag {
        Tag::owned(Self::new(ty, observer))
    }
}

impl Event for ObserverEvent {
    fn handle(&self, ok: bool) {
        match self.observer.upgrade() {
            Some(observer) => observer.on_event(ok, self.ty),
            None => crate::ktrace!("{} event dropped, observer gone", self.ty),
        }
    }

    fn event_type(&self) -> EventType {
        self.ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(bool, EventType)>>,
    }

    impl EventObserver for Recorder {
        fn on_event(&self, ok: bool, ty: EventType) {
            self.seen.lock().unwrap().push((ok, ty));
        }
    }

    struct Dropped(Arc<AtomicBool>);

    impl Drop for Dropped {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Event for Dropped {
        fn handle(&self, _ok: bool) {
            assert!(!self.0.load(Ordering::SeqCst));
        }

        fn event_type(&self) -> EventType {
            EventType::Finish
        }
    }

    #[test]
    fn test_owned_tag_dropped_after_dispatch() {
        let dropped = Arc::new(AtomicBool::new(false));
        let tag = Tag::owned(Dropped(Arc::clone(&dropped)));
        assert_eq!(tag.event_type(), EventType::Finish);
        tag.dispatch(true);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_transient_routes_to_observer() {
        let rec = Arc::new(Recorder::default());
        TransientEvent::tag(EventType::Connection, rec.clone()).dispatch(false);
        assert_eq!(*rec.seen.lock().unwrap(), vec![(false, EventType::Connection)]);
    }

    #[test]
    fn test_direction_event_pending() {
        let rec = Arc::new(Recorder::default());
        let weak: Weak<dyn EventObserver> = Arc::downgrade(&rec) as Weak<dyn EventObserver>;
        let ev = Arc::new(DirectionEvent::new(EventType::Read, weak));

        assert!(ev.mark_pending());
        assert!(ev.is_pending());
        assert!(!ev.mark_pending());

        ev.tag().dispatch(true);
        assert!(!ev.is_pending());
        assert!(ev.mark_pending());
        assert_eq!(*rec.seen.lock().unwrap(), vec![(true, EventType::Read)]);
    }

    #[test]
    fn test_weak_observer_gone_is_noop() {
        let rec = Arc::new(Recorder::default());
        let weak: Weak<dyn EventObserver> = Arc::downgrade(&rec) as Weak<dyn EventObserver>;
        let tag = ObserverEvent::tag(EventType::Timeout, weak.clone());
        let dir = Arc::new(DirectionEvent::new(EventType::Write, weak));
        dir.mark_pending();
        drop(rec);

        tag.dispatch(true);
        dir.tag().dispatch(false);
        assert!(!dir.is_pending());
    }

    #[test]
    fn test_display() {
        assert_eq!(EventType::Timeout.to_string(), "timeout");
        assert!(EventType::Read.is_direction());
        assert!(!EventType::Finish.is_direction());
    }
}
