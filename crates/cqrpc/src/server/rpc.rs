//! Server-side call state machine
//!
//! ```text
//!   Connection ──► Initialize ──► Streaming ──► Finishing ──► Done
//!       │              │         Read ⇄ Write      │
//!       │              └──────── stop() from any phase ─────┘
//!       └─ ok=false: listener released
//! ```
//!
//! One `Rpc` serves one call. The listening instance is owned by its
//! Connection event; once matched it joins the server's [`RpcPool`]
//! and leaves it again when the call is over.
//!
//! # Concurrency
//!
//! Events for one call are handled under a per-call dispatch mutex, so
//! handler callbacks never overlap. `write`/`finish`/`stop` may come from
//! any thread; the state they share with event handling sits behind a
//! short spinlock. At most one read and one outbound operation (write or
//! finish) are armed at a time; further outbound operations wait in the
//! pending queue, and a finish that does not fit is parked in a slot of
//! its own so it still runs after the buffered writes.
//!
//! [`RpcPool`]: super::RpcPool

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use cqrpc_core::{
    kdebug, kerror, kwarn, ActiveObject, CallId, DirectionEvent, EventObserver, EventType,
    PendingEntry, PendingKind, PendingQueue, Ref, RpcResult, SpinLock, Status, Tag,
    TransientEvent, WeakRef,
};
use cqrpc_runtime::{panic_message, CompletionQueue, PendingOp};

use super::handler::Handler;
use super::pool::PooledCall;
use super::transport::{CallSlot, ServerStream};
use super::ServerShared;
use crate::kind::CallKind;

/// Protocol phase of a server call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Listening for a call
    #[default]
    Connection,
    Initialize,
    Streaming,
    /// Final status requested
    Finishing,
    Done,
}

#[derive(Default)]
struct IoState {
    phase: Phase,
    /// Outbound operation currently armed
    write_op: Option<PendingKind>,
    finish_requested: bool,
    /// Finish that did not fit in the pending queue
    deferred_finish: Option<Status>,
    finish_result: Option<bool>,
    reads_done: bool,
    done_armed: bool,
    done_fired: bool,
}

struct DispatchState<Req, Resp> {
    handler: Option<Box<dyn Handler<Req, Resp>>>,
    /// The handler panicked; only `on_finish` is still delivered.
    handler_failed: bool,
}

pub(crate) struct Rpc<Req, Resp> {
    id: CallId,
    shared: Arc<ServerShared<Req, Resp>>,
    cq: Arc<CompletionQueue>,
    slot: Arc<CallSlot<Req, Resp>>,
    stream: OnceLock<Arc<dyn ServerStream<Req, Resp>>>,
    read_event: Arc<DirectionEvent>,
    write_event: Arc<DirectionEvent>,
    pending: PendingQueue<PendingEntry<Resp>>,
    io: SpinLock<IoState>,
    dispatch: Mutex<DispatchState<Req, Resp>>,
    stopped: AtomicBool,
    /// Self as an observer, for one-shot events that must keep the call alive
    observer: Weak<dyn EventObserver>,
    weak_self: WeakRef<Rpc<Req, Resp>>,
}

impl<Req, Resp> Rpc<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Arm a listening call on `cq`.
    pub(crate) fn listen(
        shared: &Arc<ServerShared<Req, Resp>>,
        cq: &Arc<CompletionQueue>,
    ) -> RpcResult<()> {
        let rpc = Ref::new_cyclic(|weak: &WeakRef<Self>| {
            let observer: Weak<dyn EventObserver> = weak.as_weak().clone();
            Rpc {
                id: CallId::next(),
                shared: Arc::clone(shared),
                cq: Arc::clone(cq),
                slot: Arc::new(CallSlot::new()),
                stream: OnceLock::new(),
                read_event: Arc::new(DirectionEvent::new(EventType::Read, observer.clone())),
                write_event: Arc::new(DirectionEvent::new(EventType::Write, observer.clone())),
                pending: PendingQueue::new(shared.max_pending),
                io: SpinLock::new(IoState::default()),
                dispatch: Mutex::new(DispatchState {
                    handler: None,
                    handler_failed: false,
                }),
                stopped: AtomicBool::new(false),
                observer,
                weak_self: weak.clone(),
            }
        });

        let slot = Arc::clone(&rpc.slot);
        // From here on the Connection event holds the only strong reference
        let observer: Arc<dyn EventObserver> = rpc.into_arc();
        let op = cq.arm(TransientEvent::tag(EventType::Connection, observer))?;
        shared.transport.request_call(slot, op);
        Ok(())
    }
}

impl<Req, Resp> Rpc<Req, Resp> {
    #[inline]
    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.io.lock().phase
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn stream(&self) -> Option<&Arc<dyn ServerStream<Req, Resp>>> {
        self.stream.get()
    }

    fn call_handle(&self) -> Option<ServerCall<Req, Resp>> {
        self.weak_self.lock().map(|rpc| ServerCall { rpc })
    }

    fn arm(&self, tag: Tag) -> Option<PendingOp> {
        match self.cq.arm(tag) {
            Ok(op) => Some(op),
            Err(e) => {
                kerror!("{}: cannot arm on queue {}: {}", self.id, self.cq.index(), e);
                None
            }
        }
    }

    /// Arm a one-shot event that keeps this call alive until handled.
    fn arm_transient(&self, ty: EventType) -> Option<PendingOp> {
        let observer = self.observer.upgrade()?;
        self.arm(TransientEvent::tag(ty, observer))
    }

    // Outbound operations

    /// Queue or send a response. False if the call is over, finishing, or
    /// the pending queue is full.
    pub(crate) fn write(&self, message: Resp) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };
        let mut io = self.io.lock();
        if self.is_stopped() || io.finish_requested {
            return false;
        }
        if io.write_op.is_none() {
            io.write_op = Some(PendingKind::Write);
            drop(io);
            self.arm_write(stream, message);
            true
        } else if self.pending.emplace(PendingEntry::write(message)) {
            true
        } else {
            drop(io);
            self.shared.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
            kdebug!("{}: pending queue full, write rejected", self.id);
            false
        }
    }

    /// Request the final status. It is sent after every queued write.
    /// False if a finish was already requested or the call is stopped.
    pub(crate) fn finish(&self, status: Status) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };
        let mut io = self.io.lock();
        if self.is_stopped() || io.finish_requested {
            return false;
        }
        io.finish_requested = true;
        if io.write_op.is_none() {
            io.write_op = Some(PendingKind::Finish);
            drop(io);
            self.arm_finish(stream, status);
        } else if self.pending.max_size().map_or(true, |max| self.pending.len() < max) {
            // Pushes only happen under the io lock, so the room is still there
            let queued = self.pending.emplace(PendingEntry::finish(status));
            debug_assert!(queued);
        } else {
            io.deferred_finish = Some(status);
        }
        true
    }

    /// Cooperative cancel. Idempotent, callable from any thread.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut io = self.io.lock();
            io.deferred_finish = None;
            self.pending.clear()
        };
        kdebug!("{}: stop requested ({} queued writes dropped)", self.id, dropped);

        if let Some(stream) = self.stream() {
            stream.cancel();
        }
        self.shared.pool.stop_signal().notify();
        // Evaluate termination on a worker even if nothing else is armed
        if let Some(op) = self.arm_transient(EventType::Stop) {
            op.complete(true);
        }
    }

    fn arm_read(&self, stream: &Arc<dyn ServerStream<Req, Resp>>) {
        if self.is_stopped() {
            return;
        }
        let claimed = self.read_event.mark_pending();
        debug_assert!(claimed, "read armed while another read is pending");
        if !claimed {
            kerror!("{}: read already pending, stopping call", self.id);
            self.stop();
            return;
        }
        if let Some(op) = self.arm(self.read_event.tag()) {
            stream.read(op);
        }
    }

    fn arm_write(&self, stream: &Arc<dyn ServerStream<Req, Resp>>, message: Resp) {
        let claimed = self.write_event.mark_pending();
        debug_assert!(claimed, "write armed while another write is pending");
        if !claimed {
            kerror!("{}: write already pending, stopping call", self.id);
            self.stop();
            return;
        }
        if let Some(op) = self.arm(self.write_event.tag()) {
            stream.write(message, op);
        }
    }

    fn arm_finish(&self, stream: &Arc<dyn ServerStream<Req, Resp>>, status: Status) {
        self.io.lock().phase = Phase::Finishing;
        kdebug!("{}: finishing with {}", self.id, status);
        if let Some(op) = self.arm_transient(EventType::Finish) {
            stream.finish(status, op);
        }
    }

    /// Start the next queued outbound operation, or free the direction.
    fn advance_writes(&self) {
        let next = {
            let mut io = self.io.lock();
            let next = if self.is_stopped() {
                None
            } else {
                self.pending
                    .pop()
                    .or_else(|| io.deferred_finish.take().map(PendingEntry::finish))
            };
            io.write_op = next.as_ref().map(|entry| entry.kind);
            next
        };
        let (Some(entry), Some(stream)) = (next, self.stream()) else {
            return;
        };
        match entry.kind {
            PendingKind::Write => {
                if let Some(message) = entry.message {
                    self.arm_write(stream, message);
                }
            }
            PendingKind::Finish => self.arm_finish(stream, entry.status.unwrap_or_default()),
            PendingKind::WritesDone => {
                kwarn!("{}: half-close queued on a server call", self.id);
                self.io.lock().write_op = None;
            }
        }
    }

}

impl<Req, Resp> Rpc<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn handle_event(&self, dispatch: &mut DispatchState<Req, Resp>, ok: bool, ty: EventType) {
        match ty {
            EventType::Connection => self.on_connection(dispatch, ok),
            EventType::Read => self.on_read(dispatch, ok),
            EventType::Write => self.on_write(ok),
            EventType::Finish => self.on_finish_sent(ok),
            EventType::Done => self.on_done(ok),
            EventType::Stop => {}
            other => kwarn!("{}: unexpected {} event", self.id, other),
        }
    }

    fn on_connection(&self, dispatch: &mut DispatchState<Req, Resp>, ok: bool) {
        if !ok {
            // Transport shut down; the listener goes away with this event
            self.io.lock().phase = Phase::Done;
            return;
        }
        let Some(stream) = self.slot.take() else {
            kerror!("{}: connection completed without a stream", self.id);
            self.io.lock().phase = Phase::Done;
            return;
        };
        let _ = self.stream.set(Arc::clone(&stream));
        self.io.lock().phase = Phase::Initialize;
        self.shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
        kdebug!("{}: accepted {} ({})", self.id, stream.method(), stream.kind());

        // Replace this listener while still accepting
        if self.shared.pool.active() {
            if let Err(e) = Rpc::listen(&self.shared, &self.cq) {
                kwarn!("{}: could not arm successor listener: {}", self.id, e);
            }
        }

        let Some(me) = self.weak_self.lock() else {
            return;
        };
        let member: Arc<dyn PooledCall> = me.into_arc();
        if !self.shared.pool.add(member) {
            return;
        }
        self.initialize(dispatch, &stream);
    }

    fn initialize(
        &self,
        dispatch: &mut DispatchState<Req, Resp>,
        stream: &Arc<dyn ServerStream<Req, Resp>>,
    ) {
        if let Some(op) = self.arm_transient(EventType::Done) {
            self.io.lock().done_armed = true;
            stream.notify_when_done(op);
        }

        dispatch.handler = Some(self.shared.factory.create(stream.method(), stream.kind()));
        self.with_handler(dispatch, |handler, call| handler.initialize(call));

        {
            let mut io = self.io.lock();
            if io.phase == Phase::Initialize {
                io.phase = Phase::Streaming;
            }
        }
        self.arm_read(stream);
    }

    fn on_read(&self, dispatch: &mut DispatchState<Req, Resp>, ok: bool) {
        let Some(stream) = self.stream().cloned() else {
            return;
        };
        if !ok {
            let first = !std::mem::replace(&mut self.io.lock().reads_done, true);
            if first && !self.is_stopped() {
                self.with_handler(dispatch, |handler, call| handler.on_reads_done(call));
            }
            return;
        }
        if let Some(request) = stream.take_message() {
            if !self.is_stopped() {
                self.with_handler(dispatch, |handler, call| handler.on_request(call, request));
            }
        }
        if !dispatch.handler_failed {
            self.arm_read(&stream);
        }
    }

    fn on_write(&self, ok: bool) {
        if !ok {
            self.io.lock().write_op = None;
            kdebug!("{}: write failed, stopping", self.id);
            self.stop();
            return;
        }
        self.advance_writes();
    }

    fn on_finish_sent(&self, ok: bool) {
        let mut io = self.io.lock();
        io.finish_result = Some(ok);
        io.write_op = None;
    }

    fn on_done(&self, ok: bool) {
        self.io.lock().done_fired = true;
        if !ok {
            kdebug!("{}: cancelled by peer", self.id);
            self.stop();
        }
    }

    fn with_handler<F>(&self, dispatch: &mut DispatchState<Req, Resp>, f: F)
    where
        F: FnOnce(&mut dyn Handler<Req, Resp>, &ServerCall<Req, Resp>),
    {
        if dispatch.handler_failed {
            return;
        }
        let Some(call) = self.call_handle() else {
            return;
        };
        if let Some(handler) = dispatch.handler.as_mut() {
            f(handler.as_mut(), &call);
        }
    }

    fn handler_panicked(
        &self,
        dispatch: &mut DispatchState<Req, Resp>,
        ty: EventType,
        payload: &(dyn Any + Send),
    ) {
        let msg = panic_message(payload);
        kerror!("{}: handler panicked during {}: {}", self.id, ty, msg);
        self.shared.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
        dispatch.handler_failed = true;
        if !self.finish(Status::internal(format!("handler panicked: {}", msg))) {
            self.stop();
        }
    }

    fn maybe_terminate(&self, dispatch: &mut DispatchState<Req, Resp>) {
        let ok = {
            let mut io = self.io.lock();
            if matches!(io.phase, Phase::Connection | Phase::Done) {
                return;
            }
            let idle = io.write_op.is_none()
                && !self.read_event.is_pending()
                && (!io.done_armed || io.done_fired);
            if !idle || !(self.is_stopped() || io.finish_result.is_some()) {
                return;
            }
            io.phase = Phase::Done;
            io.finish_result == Some(true)
        };

        if let Some(mut handler) = dispatch.handler.take() {
            if let Some(call) = self.call_handle() {
                let finished =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_finish(&call, ok)));
                if let Err(payload) = finished {
                    self.shared.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                    kerror!(
                        "{}: on_finish panicked: {}",
                        self.id,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        let counter = if ok {
            &self.shared.stats.finished_ok
        } else {
            &self.shared.stats.finished_err
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.shared.pool.stop_signal().notify();
        }
        self.shared.pool.remove(self.id);
        kdebug!("{}: done (ok={})", self.id, ok);
    }
}

impl<Req, Resp> EventObserver for Rpc<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn on_event(&self, ok: bool, ty: EventType) {
        let mut dispatch = self.dispatch.lock().unwrap();
        if self.phase() == Phase::Done {
            return;
        }
        let state = &mut *dispatch;
        let handled = panic::catch_unwind(AssertUnwindSafe(|| self.handle_event(state, ok, ty)));
        if let Err(payload) = handled {
            self.handler_panicked(state, ty, payload.as_ref());
        }
        self.maybe_terminate(state);
    }
}

impl<Req, Resp> PooledCall for Rpc<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn id(&self) -> CallId {
        self.id
    }

    fn stop(&self) {
        Rpc::stop(self);
    }

    fn is_stopped(&self) -> bool {
        Rpc::is_stopped(self)
    }
}

/// Handle on an accepted call, given to handlers.
///
/// Cheap to clone; writes and finish may be issued from any thread.
pub struct ServerCall<Req, Resp> {
    rpc: Ref<Rpc<Req, Resp>>,
}

impl<Req, Resp> Clone for ServerCall<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.acquire(),
        }
    }
}

impl<Req, Resp> ServerCall<Req, Resp> {
    pub fn id(&self) -> CallId {
        self.rpc.id()
    }

    pub fn method(&self) -> &str {
        self.rpc.stream().map_or("", |s| s.method())
    }

    pub fn kind(&self) -> CallKind {
        self.rpc.stream().map_or(CallKind::Unary, |s| s.kind())
    }

    /// Send a response. False if rejected (pending queue full, finishing
    /// or stopped).
    pub fn write(&self, message: Resp) -> bool {
        self.rpc.write(message)
    }

    /// End the call with `status` once queued writes are flushed.
    pub fn finish(&self, status: Status) -> bool {
        self.rpc.finish(status)
    }

    pub fn stop(&self) {
        self.rpc.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.rpc.is_stopped()
    }

    pub fn phase(&self) -> Phase {
        self.rpc.phase()
    }

    /// Outbound operations waiting behind the armed one.
    pub fn pending_writes(&self) -> usize {
        self.rpc.pending_writes()
    }
}
