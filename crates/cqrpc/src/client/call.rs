//! Client-side call state machine
//!
//! ```text
//!   Initialize ──► Starting ──► Streaming ──► Finishing ──► Done
//!   (posted on      start_call   Read ⇄ Write    status
//!    creation)                   WritesDone      collected
//!
//!   Timeout (deadline alarm) ──► stop() ──► status DeadlineExceeded
//! ```
//!
//! Writes issued before the server accepts the call are buffered apart
//! from the pending queue and go out in order once Start completes; the
//! `max_pending_queue_size` bound applies from Start on. The call ends
//! when the final status is in and neither direction has an operation in
//! flight; the observer then sees `Finish` exactly once.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use cqrpc_core::{
    kdebug, kerror, kwarn, CallId, DirectionEvent, EventObserver, EventType, ObserverEvent,
    PendingEntry, PendingKind, PendingQueue, Ref, RpcError, RpcResult, SpinLock, Status, Tag,
    TransientEvent, WeakRef,
};
use cqrpc_runtime::{panic_message, CompletionQueue, PendingOp, TimerHandle};

use super::observer::ClientObserver;
use super::transport::ClientStream;
use super::ClientShared;
use crate::kind::CallKind;
use crate::server::PooledCall;

/// Protocol phase of a client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientPhase {
    #[default]
    Initialize,
    /// Waiting for the server to accept
    Starting,
    Streaming,
    /// Final status requested
    Finishing,
    Done,
}

struct CallIo<Req> {
    phase: ClientPhase,
    started: bool,
    /// Outbound work issued before Start, not charged to the pending bound
    early: VecDeque<PendingEntry<Req>>,
    /// Outbound operation currently armed
    write_op: Option<PendingKind>,
    half_closed: bool,
    /// Half-close that did not fit in the pending queue
    deferred_writes_done: bool,
    finish_armed: bool,
    /// Local reason the call ended; wins over the transport status
    abort: Option<Status>,
    status: Option<Status>,
    timer: Option<TimerHandle>,
}

impl<Req> Default for CallIo<Req> {
    fn default() -> Self {
        Self {
            phase: ClientPhase::default(),
            started: false,
            early: VecDeque::new(),
            write_op: None,
            half_closed: false,
            deferred_writes_done: false,
            finish_armed: false,
            abort: None,
            status: None,
            timer: None,
        }
    }
}

impl<Req> CallIo<Req> {
    fn settle(&mut self, status: Status) {
        self.status = Some(self.abort.take().unwrap_or(status));
    }
}

/// Parameters of one outbound call.
pub(crate) struct CallSpec<Req, Resp> {
    pub method: String,
    pub kind: CallKind,
    pub channel: usize,
    pub deadline: Option<Instant>,
    pub observer: Arc<dyn ClientObserver<Req, Resp>>,
}

/// One outbound call.
pub struct ClientCall<Req, Resp> {
    id: CallId,
    method: String,
    kind: CallKind,
    channel: usize,
    deadline: Option<Instant>,
    shared: Arc<ClientShared<Req, Resp>>,
    cq: Arc<CompletionQueue>,
    observer: Arc<dyn ClientObserver<Req, Resp>>,
    stream: OnceLock<Arc<dyn ClientStream<Req, Resp>>>,
    read_event: Arc<DirectionEvent>,
    write_event: Arc<DirectionEvent>,
    pending: PendingQueue<PendingEntry<Req>>,
    io: SpinLock<CallIo<Req>>,
    responses: Mutex<VecDeque<Resp>>,
    dispatch: Mutex<()>,
    stopped: AtomicBool,
    event_observer: Weak<dyn EventObserver>,
}

impl<Req, Resp> ClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Create the call on `cq`. It is not started until [`post`](Self::post).
    pub(crate) fn new(
        shared: &Arc<ClientShared<Req, Resp>>,
        cq: &Arc<CompletionQueue>,
        spec: CallSpec<Req, Resp>,
    ) -> Ref<Self> {
        Ref::new_cyclic(|weak: &WeakRef<Self>| {
            let event_observer: Weak<dyn EventObserver> = weak.as_weak().clone();
            ClientCall {
                id: CallId::next(),
                method: spec.method,
                kind: spec.kind,
                channel: spec.channel,
                deadline: spec.deadline,
                shared: Arc::clone(shared),
                cq: Arc::clone(cq),
                observer: spec.observer,
                stream: OnceLock::new(),
                read_event: Arc::new(DirectionEvent::new(
                    EventType::Read,
                    event_observer.clone(),
                )),
                write_event: Arc::new(DirectionEvent::new(
                    EventType::Write,
                    event_observer.clone(),
                )),
                pending: PendingQueue::new(shared.max_pending),
                io: SpinLock::new(CallIo::default()),
                responses: Mutex::new(VecDeque::new()),
                dispatch: Mutex::new(()),
                stopped: AtomicBool::new(false),
                event_observer,
            }
        })
    }

    /// Post the Initialize event; the call starts on a worker.
    pub(crate) fn post(&self) -> RpcResult<()> {
        let observer = self
            .event_observer
            .upgrade()
            .ok_or(RpcError::NotActive)?;
        let op = self.cq.arm(TransientEvent::tag(EventType::Initialize, observer))?;
        op.complete(true);
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ClientPhase {
        self.io.lock().phase
    }

    /// Final status, once the call is done.
    pub fn status(&self) -> Option<Status> {
        let io = self.io.lock();
        if io.phase == ClientPhase::Done {
            io.status.clone()
        } else {
            None
        }
    }

    /// Oldest response not yet consumed.
    pub fn next_response(&self) -> Option<Resp> {
        self.responses.lock().unwrap().pop_front()
    }

    /// Outbound operations waiting behind the armed one.
    pub fn pending_writes(&self) -> usize {
        self.io.lock().early.len() + self.pending.len()
    }

    /// Send a request. False once half-closed or stopped, or when the
    /// pending queue is full. Requests written before Start are always
    /// accepted.
    pub fn write(&self, message: Req) -> bool {
        let mut io = self.io.lock();
        if self.is_stopped() || io.half_closed || io.phase == ClientPhase::Done {
            return false;
        }
        if !io.started {
            io.early.push_back(PendingEntry::write(message));
            return true;
        }
        let ready = io.write_op.is_none() && io.early.is_empty() && self.pending.is_empty();
        if let (true, Some(stream)) = (ready, self.stream.get()) {
            io.write_op = Some(PendingKind::Write);
            drop(io);
            self.arm_write(stream, message);
            return true;
        }
        if self.pending.emplace(PendingEntry::write(message)) {
            return true;
        }
        drop(io);
        self.shared.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
        kdebug!("{}: pending queue full, write rejected", self.id);
        false
    }

    /// Half-close the request direction after every queued write.
    pub fn writes_done(&self) -> bool {
        let mut io = self.io.lock();
        if self.is_stopped() || io.half_closed || io.phase == ClientPhase::Done {
            return false;
        }
        io.half_closed = true;
        if !io.started {
            io.early.push_back(PendingEntry::writes_done());
            return true;
        }
        let ready = io.write_op.is_none() && io.early.is_empty() && self.pending.is_empty();
        if let (true, Some(stream)) = (ready, self.stream.get()) {
            io.write_op = Some(PendingKind::WritesDone);
            drop(io);
            self.arm_writes_done(stream);
        } else if !self.pending.emplace(PendingEntry::writes_done()) {
            io.deferred_writes_done = true;
        }
        true
    }

    /// Cooperative cancel. Idempotent, callable from any thread.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut io = self.io.lock();
            io.deferred_writes_done = false;
            let early = io.early.len();
            io.early.clear();
            early + self.pending.clear()
        };
        kdebug!("{}: stop requested ({} queued writes dropped)", self.id, dropped);

        if let Some(stream) = self.stream.get() {
            stream.cancel();
        }
        self.shared.pool.stop_signal().notify();
        if let Some(op) = self.arm_transient(EventType::Stop) {
            op.complete(true);
        }
    }

    /// Stop the call and report `status` instead of what the transport
    /// delivers. No effect once the call is stopped or its status is in.
    pub(crate) fn abort(&self, status: Status) {
        {
            let mut io = self.io.lock();
            if self.is_stopped() || io.status.is_some() {
                return;
            }
            io.abort.get_or_insert(status);
        }
        self.stop();
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

    fn arm_transient(&self, ty: EventType) -> Option<PendingOp> {
        let observer = self.event_observer.upgrade()?;
        self.arm(TransientEvent::tag(ty, observer))
    }

    fn arm_read(&self, stream: &Arc<dyn ClientStream<Req, Resp>>) {
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

    fn arm_write(&self, stream: &Arc<dyn ClientStream<Req, Resp>>, message: Req) {
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

    fn arm_writes_done(&self, stream: &Arc<dyn ClientStream<Req, Resp>>) {
        if let Some(op) = self.arm_transient(EventType::Write) {
            stream.writes_done(op);
        }
    }

    fn arm_finish(&self, stream: &Arc<dyn ClientStream<Req, Resp>>) {
        {
            let mut io = self.io.lock();
            if io.finish_armed {
                return;
            }
            io.finish_armed = true;
            io.phase = ClientPhase::Finishing;
        }
        if let Some(op) = self.arm_transient(EventType::Finish) {
            stream.finish(op);
        }
    }

    fn arm_timeout(&self, deadline: Instant) {
        // Weak: an armed alarm does not keep the call alive
        let tag = ObserverEvent::tag(EventType::Timeout, self.event_observer.clone());
        if let Some(op) = self.arm(tag) {
            let handle = self.shared.timer.schedule(deadline, op);
            self.io.lock().timer = Some(handle);
        }
    }

    /// Start the next queued outbound operation if the direction is free.
    /// `completed` releases the operation that just finished first.
    fn pump_writes(&self, completed: bool) {
        let next = {
            let mut io = self.io.lock();
            if completed {
                io.write_op = None;
            }
            if io.write_op.is_some() || !io.started || self.is_stopped() {
                return;
            }
            let next = io.early.pop_front().or_else(|| self.pending.pop()).or_else(|| {
                std::mem::take(&mut io.deferred_writes_done).then(PendingEntry::writes_done)
            });
            io.write_op = next.as_ref().map(|entry| entry.kind);
            next
        };
        let (Some(entry), Some(stream)) = (next, self.stream.get()) else {
            return;
        };
        match entry.kind {
            PendingKind::Write => {
                if let Some(message) = entry.message {
                    self.arm_write(stream, message);
                }
            }
            PendingKind::WritesDone => self.arm_writes_done(stream),
            PendingKind::Finish => {
                kwarn!("{}: server finish queued on a client call", self.id);
                self.io.lock().write_op = None;
            }
        }
    }

    fn notify(&self, ok: bool, ty: EventType) {
        self.observer.on_event(self, ok, ty);
    }

    // Event handling

    fn handle_event(&self, ok: bool, ty: EventType) {
        match ty {
            EventType::Initialize => self.on_initialize(ok),
            EventType::Start => self.on_start(ok),
            EventType::Read => self.on_read(ok),
            EventType::Write => self.on_write(ok),
            EventType::Finish => self.on_finish(ok),
            EventType::Timeout => self.on_timeout(ok),
            EventType::Stop => self.on_stop(),
            other => kwarn!("{}: unexpected {} event", self.id, other),
        }
    }

    fn on_initialize(&self, ok: bool) {
        if !ok || self.is_stopped() {
            self.io.lock().settle(Status::cancelled());
            return;
        }
        let Some(op) = self.arm_transient(EventType::Start) else {
            self.io
                .lock()
                .settle(Status::unavailable("completion queue shut down"));
            return;
        };
        self.io.lock().phase = ClientPhase::Starting;
        let stream = self
            .shared
            .transport
            .start_call(self.channel, &self.method, self.kind, op);
        let _ = self.stream.set(Arc::clone(&stream));
        kdebug!("{}: starting {} ({})", self.id, self.method, self.kind);

        // A stop that raced with start_call never saw the stream
        if self.is_stopped() {
            stream.cancel();
        }
        if let Some(deadline) = self.deadline {
            self.arm_timeout(deadline);
        }
    }

    fn on_start(&self, ok: bool) {
        let Some(stream) = self.stream.get() else {
            return;
        };
        {
            let mut io = self.io.lock();
            io.started = true;
            if io.phase == ClientPhase::Starting {
                io.phase = ClientPhase::Streaming;
            }
        }
        self.notify(ok, EventType::Start);
        if !ok || self.is_stopped() {
            self.arm_finish(stream);
            return;
        }
        self.arm_read(stream);
        self.pump_writes(false);
    }

    fn on_read(&self, ok: bool) {
        let Some(stream) = self.stream.get() else {
            return;
        };
        if !ok {
            // Server finished or the call was cancelled
            self.arm_finish(stream);
            return;
        }
        if let Some(msg) = stream.take_message() {
            self.responses.lock().unwrap().push_back(msg);
            self.notify(true, EventType::Read);
        }
        if self.is_stopped() {
            self.arm_finish(stream);
        } else {
            self.arm_read(stream);
        }
    }

    fn on_write(&self, ok: bool) {
        if !ok {
            // Call is ending; the read side collects the status
            let mut io = self.io.lock();
            io.write_op = None;
            io.early.clear();
            self.pending.clear();
            return;
        }
        // Observers see one Write per request; the half-close is silent
        if self.io.lock().write_op == Some(PendingKind::Write) {
            self.notify(true, EventType::Write);
        }
        self.pump_writes(true);
    }

    fn on_finish(&self, ok: bool) {
        let status = self
            .stream
            .get()
            .and_then(|s| s.take_status())
            .unwrap_or_else(|| if ok { Status::ok() } else { Status::cancelled() });
        self.io.lock().settle(status);
    }

    fn on_timeout(&self, ok: bool) {
        if !ok {
            return;
        }
        {
            let mut io = self.io.lock();
            if io.status.is_some() || io.abort.is_some() {
                return;
            }
            io.abort = Some(Status::deadline_exceeded());
        }
        self.shared.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        kdebug!("{}: deadline exceeded", self.id);
        self.notify(true, EventType::Timeout);
        self.stop();
    }

    fn on_stop(&self) {
        // Make sure a status gets collected even with no read armed
        let started = self.io.lock().started;
        if let (true, Some(stream)) = (started, self.stream.get()) {
            if !self.read_event.is_pending() {
                self.arm_finish(stream);
            }
        }
    }

    fn maybe_terminate(&self) {
        let (status, timer) = {
            let mut io = self.io.lock();
            if io.phase == ClientPhase::Done || io.write_op.is_some() {
                return;
            }
            if self.read_event.is_pending() {
                return;
            }
            let Some(status) = io.status.clone() else {
                return;
            };
            io.phase = ClientPhase::Done;
            io.early.clear();
            (status, io.timer.take())
        };

        if let Some(handle) = timer {
            self.shared.timer.cancel(handle);
        }
        self.pending.clear();

        let ok = status.is_ok();
        let counter = if ok {
            &self.shared.stats.finished_ok
        } else {
            &self.shared.stats.finished_err
        };
        counter.fetch_add(1, Ordering::Relaxed);
        kdebug!("{}: done with {}", self.id, status);

        let notified = panic::catch_unwind(AssertUnwindSafe(|| self.notify(ok, EventType::Finish)));
        if let Err(payload) = notified {
            self.observer_panicked(EventType::Finish, payload.as_ref());
        }

        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.shared.pool.stop_signal().notify();
        }
        self.shared.pool.remove(self.id);
        self.shared.release_slot();
    }

    fn observer_panicked(&self, ty: EventType, payload: &(dyn std::any::Any + Send)) {
        self.shared.stats.observer_panics.fetch_add(1, Ordering::Relaxed);
        kerror!(
            "{}: observer panicked during {}: {}",
            self.id,
            ty,
            panic_message(payload)
        );
    }
}

impl<Req, Resp> EventObserver for ClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn on_event(&self, ok: bool, ty: EventType) {
        let _dispatch = self.dispatch.lock().unwrap();
        if self.phase() == ClientPhase::Done {
            return;
        }
        let handled = panic::catch_unwind(AssertUnwindSafe(|| self.handle_event(ok, ty)));
        if let Err(payload) = handled {
            self.observer_panicked(ty, payload.as_ref());
            self.stop();
        }
        self.maybe_terminate();
    }
}

impl<Req, Resp> PooledCall for ClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn id(&self) -> CallId {
        self.id
    }

    fn stop(&self) {
        ClientCall::stop(self);
    }

    fn is_stopped(&self) -> bool {
        ClientCall::is_stopped(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::observer::{FutureObserver, UnaryFuture};
    use crate::client::transport::ClientTransport;
    use crate::client::ClientStats;
    use crate::config::Credentials;
    use crate::server::RpcPool;
    use cqrpc_core::{ActiveObject, StatusCode};
    use cqrpc_runtime::TimerService;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    /// Stream that records what the call arms and flags overlap.
    #[derive(Default)]
    struct MockStream {
        start: Mutex<Option<PendingOp>>,
        read: Mutex<Option<PendingOp>>,
        current: Mutex<Option<String>>,
        write: Mutex<Option<PendingOp>>,
        written: Mutex<Vec<u32>>,
        writes_done: Mutex<Option<PendingOp>>,
        finish: Mutex<Option<PendingOp>>,
        status: Mutex<Option<Status>>,
        cancelled: AtomicBool,
        overlap: AtomicBool,
        cancels: AtomicUsize,
    }

    impl MockStream {
        fn accept(&self) {
            let op = self.start.lock().unwrap().take().expect("call not started");
            op.complete(true);
        }

        fn deliver(&self, msg: Option<&str>) {
            let op = self.read.lock().unwrap().take().expect("no read armed");
            *self.current.lock().unwrap() = msg.map(str::to_string);
            op.complete(msg.is_some());
        }

        fn complete_write(&self) {
            let op = self.write.lock().unwrap().take().expect("no write armed");
            op.complete(true);
        }

        fn complete_writes_done(&self) {
            let op = self.writes_done.lock().unwrap().take().expect("no half-close armed");
            op.complete(true);
        }

        fn complete_finish(&self, status: Status) {
            let op = self.finish.lock().unwrap().take().expect("no finish armed");
            *self.status.lock().unwrap() = Some(status);
            op.complete(true);
        }

        fn half_close_armed(&self) -> bool {
            self.writes_done.lock().unwrap().is_some()
        }

        fn written(&self) -> Vec<u32> {
            self.written.lock().unwrap().clone()
        }
    }

    impl ClientStream<u32, String> for MockStream {
        fn read(&self, op: PendingOp) {
            if self.read.lock().unwrap().replace(op).is_some() {
                self.overlap.store(true, Ordering::SeqCst);
            }
        }

        fn take_message(&self) -> Option<String> {
            self.current.lock().unwrap().take()
        }

        fn write(&self, message: u32, op: PendingOp) {
            let closing = self.writes_done.lock().unwrap().is_some();
            if self.write.lock().unwrap().replace(op).is_some() || closing {
                self.overlap.store(true, Ordering::SeqCst);
            }
            self.written.lock().unwrap().push(message);
        }

        fn writes_done(&self, op: PendingOp) {
            if self.write.lock().unwrap().is_some() {
                self.overlap.store(true, Ordering::SeqCst);
            }
            *self.writes_done.lock().unwrap() = Some(op);
        }

        fn finish(&self, op: PendingOp) {
            if self.cancelled.load(Ordering::SeqCst) {
                op.complete(true);
            } else {
                *self.finish.lock().unwrap() = Some(op);
            }
        }

        fn take_status(&self) -> Option<Status> {
            self.status.lock().unwrap().take()
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.cancelled.store(true, Ordering::SeqCst);
            self.status
                .lock()
                .unwrap()
                .get_or_insert_with(Status::cancelled);
            drop(self.start.lock().unwrap().take());
            drop(self.read.lock().unwrap().take());
            drop(self.write.lock().unwrap().take());
            drop(self.writes_done.lock().unwrap().take());
            if let Some(op) = self.finish.lock().unwrap().take() {
                op.complete(true);
            }
        }
    }

    #[derive(Default)]
    struct MockTransport {
        streams: Mutex<Vec<Arc<MockStream>>>,
    }

    impl ClientTransport<u32, String> for MockTransport {
        fn connect(&self, _endpoint: &str, _credentials: &Credentials, _channel: usize) -> RpcResult<()> {
            Ok(())
        }

        fn start_call(
            &self,
            _channel: usize,
            _method: &str,
            _kind: CallKind,
            op: PendingOp,
        ) -> Arc<dyn ClientStream<u32, String>> {
            let stream = Arc::new(MockStream::default());
            *stream.start.lock().unwrap() = Some(op);
            self.streams.lock().unwrap().push(Arc::clone(&stream));
            stream
        }

        fn shutdown(&self) {}
    }

    /// Records every event; panics on `panic_on`.
    struct Recorder {
        events: Mutex<Vec<(EventType, bool)>>,
        panic_on: Option<EventType>,
    }

    impl Recorder {
        fn new(panic_on: Option<EventType>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                panic_on,
            })
        }

        fn count(&self, ty: EventType) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| *t == ty)
                .count()
        }

        fn events(&self) -> Vec<(EventType, bool)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ClientObserver<u32, String> for Recorder {
        fn on_event(&self, _call: &ClientCall<u32, String>, ok: bool, ty: EventType) {
            self.events.lock().unwrap().push((ty, ok));
            if self.panic_on == Some(ty) {
                panic!("observer bug on {}", ty);
            }
        }
    }

    struct Harness {
        cq: Arc<CompletionQueue>,
        shared: Arc<ClientShared<u32, String>>,
        transport: Arc<MockTransport>,
    }

    impl Harness {
        fn new(max_pending: Option<usize>) -> Self {
            let transport = Arc::new(MockTransport::default());
            let pool = Arc::new(RpcPool::new("test"));
            pool.activate().unwrap();
            let timer = Arc::new(TimerService::new("test-timer"));
            timer.activate().unwrap();
            let shared = Arc::new(ClientShared {
                transport: transport.clone(),
                pool,
                timer,
                max_pending,
                in_flight: AtomicUsize::new(0),
                stats: ClientStats::default(),
            });
            Self {
                cq: CompletionQueue::new(0, Duration::from_millis(5)),
                shared,
                transport,
            }
        }

        fn start(
            &self,
            observer: Arc<dyn ClientObserver<u32, String>>,
            kind: CallKind,
            deadline: Option<Instant>,
        ) -> Ref<ClientCall<u32, String>> {
            self.shared.reserve_slot(None).unwrap();
            let spec = CallSpec {
                method: "/test/Chat".to_string(),
                kind,
                channel: 0,
                deadline,
                observer,
            };
            let call = ClientCall::new(&self.shared, &self.cq, spec);
            let member: Arc<dyn PooledCall> = Arc::clone(call.as_arc()) as Arc<dyn PooledCall>;
            self.shared.pool.add(member);
            call.post().unwrap();
            self.pump();
            call
        }

        fn pump(&self) {
            while let Some(c) = self.cq.try_next() {
                c.dispatch();
            }
        }

        fn stream(&self) -> Arc<MockStream> {
            let streams = self.transport.streams.lock().unwrap();
            Arc::clone(streams.last().expect("no call started"))
        }

        fn accept(&self) -> Arc<MockStream> {
            let stream = self.stream();
            stream.accept();
            self.pump();
            stream
        }
    }

    #[test]
    fn test_single_in_flight_per_direction() {
        let h = Harness::new(None);
        let rec = Recorder::new(None);
        let call = h.start(rec.clone(), CallKind::BidiStreaming, None);
        assert_eq!(call.phase(), ClientPhase::Starting);

        for i in 0..3 {
            assert!(call.write(i));
        }
        assert_eq!(call.pending_writes(), 3);

        let stream = h.accept();
        assert_eq!(call.phase(), ClientPhase::Streaming);
        assert_eq!(stream.written(), vec![0]);
        assert_eq!(call.pending_writes(), 2);

        stream.deliver(Some("a"));
        h.pump();
        assert_eq!(call.next_response().as_deref(), Some("a"));

        // Direction busy: queued behind the early writes
        assert!(call.write(3));
        for _ in 0..4 {
            stream.complete_write();
            h.pump();
        }
        assert_eq!(stream.written(), vec![0, 1, 2, 3]);

        assert!(call.writes_done());
        assert!(stream.half_close_armed());
        stream.complete_writes_done();
        h.pump();
        stream.deliver(None);
        h.pump();
        stream.complete_finish(Status::ok());
        h.pump();

        assert!(!stream.overlap.load(Ordering::SeqCst));
        assert_eq!(call.phase(), ClientPhase::Done);
        assert_eq!(call.status(), Some(Status::ok()));
        // The half-close is not reported as a write
        assert_eq!(rec.count(EventType::Write), 4);
        assert_eq!(rec.count(EventType::Read), 1);
        assert_eq!(rec.events().last(), Some(&(EventType::Finish, true)));
        assert!(h.shared.pool.is_empty());
        assert_eq!(h.shared.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_writes_done_waits_behind_full_queue() {
        let h = Harness::new(Some(2));
        let call = h.start(Recorder::new(None), CallKind::ClientStreaming, None);
        let stream = h.accept();

        assert!(call.write(0));
        assert!(call.write(1));
        assert!(call.write(2));
        assert!(!call.write(3));
        assert_eq!(h.shared.stats.rejected_writes.load(Ordering::Relaxed), 1);

        assert!(call.writes_done());
        assert!(!call.writes_done());
        assert!(!call.write(4));

        for _ in 0..3 {
            assert!(!stream.half_close_armed());
            stream.complete_write();
            h.pump();
        }
        assert_eq!(stream.written(), vec![0, 1, 2]);
        assert!(stream.half_close_armed());
        assert!(!stream.overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_writes_before_start_ignore_bound() {
        let h = Harness::new(Some(0));
        let call = h.start(Recorder::new(None), CallKind::ClientStreaming, None);
        for i in 0..5 {
            assert!(call.write(i));
        }
        assert!(call.writes_done());
        assert_eq!(call.pending_writes(), 6);

        let stream = h.accept();
        for _ in 0..5 {
            assert!(!stream.half_close_armed());
            stream.complete_write();
            h.pump();
        }
        assert_eq!(stream.written(), vec![0, 1, 2, 3, 4]);
        assert!(stream.half_close_armed());

        // Once started the bound applies
        let other = h.start(Recorder::new(None), CallKind::ClientStreaming, None);
        h.accept();
        assert!(other.write(10));
        assert!(!other.write(11));
    }

    #[test]
    fn test_unary_without_response_is_internal() {
        let h = Harness::new(None);
        let (observer, future) = FutureObserver::<String>::new();
        let call = h.start(observer, CallKind::Unary, None);
        assert!(call.write(1));
        assert!(call.writes_done());

        let stream = h.accept();
        stream.complete_write();
        h.pump();
        stream.complete_writes_done();
        h.pump();
        stream.deliver(None);
        h.pump();
        stream.complete_finish(Status::ok());
        h.pump();

        let result = block_on(UnaryFuture::new(future));
        assert_eq!(result.unwrap_err().code(), StatusCode::Internal);
    }

    #[test]
    fn test_observer_panic_stops_call() {
        let h = Harness::new(None);
        let rec = Recorder::new(Some(EventType::Read));
        let call = h.start(rec.clone(), CallKind::ServerStreaming, None);
        let stream = h.accept();

        stream.deliver(Some("boom"));
        h.pump();

        assert!(call.is_stopped());
        assert_eq!(stream.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(h.shared.stats.observer_panics.load(Ordering::Relaxed), 1);
        assert_eq!(call.phase(), ClientPhase::Done);
        assert_eq!(call.status().map(|s| s.code()), Some(StatusCode::Cancelled));
        assert_eq!(rec.count(EventType::Finish), 1);
        assert_eq!(rec.events().last(), Some(&(EventType::Finish, false)));
        assert!(h.shared.pool.is_empty());
    }

    #[test]
    fn test_timeout_before_start() {
        let h = Harness::new(None);
        let rec = Recorder::new(None);
        let deadline = Instant::now() + Duration::from_millis(20);
        let call = h.start(rec.clone(), CallKind::Unary, Some(deadline));
        assert!(call.write(1));

        let give_up = Instant::now() + Duration::from_secs(5);
        while call.phase() != ClientPhase::Done {
            assert!(Instant::now() < give_up, "call never timed out");
            h.pump();
            thread::sleep(Duration::from_millis(1));
        }

        let stream = h.stream();
        assert!(stream.written().is_empty());
        assert_eq!(stream.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(
            call.status().map(|s| s.code()),
            Some(StatusCode::DeadlineExceeded)
        );
        assert_eq!(h.shared.stats.timeouts.load(Ordering::Relaxed), 1);
        assert!(rec.events().contains(&(EventType::Start, false)));
        assert_eq!(rec.count(EventType::Timeout), 1);
        assert_eq!(rec.count(EventType::Finish), 1);
    }

    #[test]
    fn test_abort_reports_local_status() {
        let h = Harness::new(None);
        let (observer, future) = FutureObserver::<String>::new();
        let call = h.start(observer, CallKind::BidiStreaming, None);
        call.abort(Status::resource_exhausted("request not accepted"));
        assert!(call.is_stopped());

        let stream = h.stream();
        assert_eq!(stream.cancels.load(Ordering::SeqCst), 1);
        h.pump();
        assert_eq!(call.phase(), ClientPhase::Done);
        assert_eq!(
            block_on(future).unwrap_err().code(),
            StatusCode::ResourceExhausted
        );
    }
}
