//! In-memory transport
//!
//! Connects a [`Server`](crate::Server) and a [`Client`](crate::Client) in
//! the same process without any wire format: messages move through
//! per-call pipes as values.
//!
//! ```text
//!   LoopbackClient::start_call ──┐          ┌── LoopbackServer::request_call
//!                                ▼          ▼
//!                     Hub: waiting calls ⇄ armed listeners  (FIFO match)
//!                                │
//!                        CallCore { c2s pipe, s2c pipe, status }
//! ```
//!
//! Locks are taken hub first, then call; completing a [`PendingOp`] only
//! posts to a completion queue, so it is safe under either.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cqrpc_core::{kdebug, RpcError, RpcResult, Status};
use cqrpc_runtime::PendingOp;

use crate::client::{ClientStream, ClientTransport};
use crate::config::{ChannelArgs, Credentials};
use crate::kind::CallKind;
use crate::server::{CallSlot, ServerStream, ServerTransport};

/// Create a connected transport pair.
pub fn pair<Req, Resp>() -> (Arc<LoopbackServer<Req, Resp>>, Arc<LoopbackClient<Req, Resp>>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let hub = Arc::new(Hub {
        state: Mutex::new(HubState {
            bound: None,
            server_down: false,
            client_down: false,
            channels: 0,
            listeners: VecDeque::new(),
            waiting: VecDeque::new(),
        }),
        matched: AtomicU64::new(0),
    });
    (
        Arc::new(LoopbackServer {
            hub: Arc::clone(&hub),
        }),
        Arc::new(LoopbackClient { hub }),
    )
}

/// One direction of a call.
struct Pipe<M> {
    queue: VecDeque<M>,
    closed: bool,
    reader: Option<PendingOp>,
    /// Message delivered by the last successful read
    current: Option<M>,
}

impl<M> Pipe<M> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            closed: false,
            reader: None,
            current: None,
        }
    }

    fn read(&mut self, op: PendingOp) {
        if let Some(msg) = self.queue.pop_front() {
            self.current = Some(msg);
            op.complete(true);
        } else if self.closed {
            op.complete(false);
        } else {
            self.reader = Some(op);
        }
    }

    fn push(&mut self, msg: M) -> bool {
        if self.closed {
            return false;
        }
        match self.reader.take() {
            Some(op) => {
                self.current = Some(msg);
                op.complete(true);
            }
            None => self.queue.push_back(msg),
        }
        true
    }

    /// Queued messages stay readable; a parked reader fails.
    fn close(&mut self) {
        self.closed = true;
        if let Some(op) = self.reader.take() {
            op.complete(false);
        }
    }
}

struct CallState<Req, Resp> {
    c2s: Pipe<Req>,
    s2c: Pipe<Resp>,
    status: Option<Status>,
    cancelled: bool,
    start: Option<PendingOp>,
    client_finish: Option<PendingOp>,
    server_done: Option<PendingOp>,
}

struct CallCore<Req, Resp> {
    method: String,
    kind: CallKind,
    state: Mutex<CallState<Req, Resp>>,
}

impl<Req, Resp> CallCore<Req, Resp> {
    fn new(method: &str, kind: CallKind, start: PendingOp) -> Self {
        Self {
            method: method.to_string(),
            kind,
            state: Mutex::new(CallState {
                c2s: Pipe::new(),
                s2c: Pipe::new(),
                status: None,
                cancelled: false,
                start: Some(start),
                client_finish: None,
                server_done: None,
            }),
        }
    }

    fn is_over(&self) -> bool {
        self.state.lock().unwrap().status.is_some()
    }

    /// End the call abnormally with `status`. No-op once it has ended.
    fn fail(&self, status: Status) {
        let mut st = self.state.lock().unwrap();
        if st.status.is_some() {
            return;
        }
        st.status = Some(status);
        st.cancelled = true;
        st.c2s.close();
        st.s2c.close();
        if let Some(op) = st.start.take() {
            op.complete(false);
        }
        if let Some(op) = st.server_done.take() {
            op.complete(false);
        }
        if let Some(op) = st.client_finish.take() {
            op.complete(true);
        }
    }

    /// Hand the call to a listener.
    fn accept(self: &Arc<Self>, slot: &CallSlot<Req, Resp>, listener: PendingOp)
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        slot.fill(Arc::new(ServerEnd {
            core: Arc::clone(self),
        }));
        listener.complete(true);
        if let Some(op) = self.state.lock().unwrap().start.take() {
            op.complete(true);
        }
    }
}

struct HubState<Req, Resp> {
    bound: Option<String>,
    server_down: bool,
    client_down: bool,
    channels: usize,
    listeners: VecDeque<(Arc<CallSlot<Req, Resp>>, PendingOp)>,
    waiting: VecDeque<Arc<CallCore<Req, Resp>>>,
}

struct Hub<Req, Resp> {
    state: Mutex<HubState<Req, Resp>>,
    matched: AtomicU64,
}

/// Server half of a loopback pair.
pub struct LoopbackServer<Req, Resp> {
    hub: Arc<Hub<Req, Resp>>,
}

impl<Req, Resp> LoopbackServer<Req, Resp> {
    /// Calls matched with a listener so far.
    pub fn matched(&self) -> u64 {
        self.hub.matched.load(Ordering::Relaxed)
    }

    /// Listeners currently armed.
    pub fn listeners(&self) -> usize {
        self.hub.state.lock().unwrap().listeners.len()
    }
}

impl<Req, Resp> ServerTransport<Req, Resp> for LoopbackServer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn bind(&self, address: &str, _args: &ChannelArgs) -> RpcResult<()> {
        let mut hub = self.hub.state.lock().unwrap();
        if hub.server_down {
            return Err(RpcError::Transport("loopback server shut down".to_string()));
        }
        if let Some(bound) = &hub.bound {
            return Err(RpcError::Transport(format!("already bound to {}", bound)));
        }
        hub.bound = Some(address.to_string());
        Ok(())
    }

    fn request_call(&self, slot: Arc<CallSlot<Req, Resp>>, op: PendingOp) {
        let mut hub = self.hub.state.lock().unwrap();
        if hub.server_down {
            drop(hub);
            op.complete(false);
            return;
        }
        while let Some(call) = hub.waiting.pop_front() {
            if call.is_over() {
                continue;
            }
            self.hub.matched.fetch_add(1, Ordering::Relaxed);
            call.accept(&slot, op);
            return;
        }
        hub.listeners.push_back((slot, op));
    }

    fn shutdown(&self) {
        let (listeners, waiting) = {
            let mut hub = self.hub.state.lock().unwrap();
            hub.server_down = true;
            hub.bound = None;
            (
                std::mem::take(&mut hub.listeners),
                std::mem::take(&mut hub.waiting),
            )
        };
        kdebug!(
            "loopback: server down, {} listeners released, {} calls refused",
            listeners.len(),
            waiting.len()
        );
        for (_, op) in listeners {
            op.complete(false);
        }
        for call in waiting {
            call.fail(Status::unavailable("server shut down"));
        }
    }
}

/// Client half of a loopback pair.
pub struct LoopbackClient<Req, Resp> {
    hub: Arc<Hub<Req, Resp>>,
}

impl<Req, Resp> LoopbackClient<Req, Resp> {
    /// Channels opened so far.
    pub fn channels(&self) -> usize {
        self.hub.state.lock().unwrap().channels
    }
}

impl<Req, Resp> ClientTransport<Req, Resp> for LoopbackClient<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn connect(&self, endpoint: &str, _credentials: &Credentials, _channel: usize) -> RpcResult<()> {
        let mut hub = self.hub.state.lock().unwrap();
        match &hub.bound {
            Some(bound) if bound == endpoint => {
                hub.client_down = false;
                hub.channels += 1;
                Ok(())
            }
            _ => Err(RpcError::Transport(format!("no server at {}", endpoint))),
        }
    }

    fn start_call(
        &self,
        _channel: usize,
        method: &str,
        kind: CallKind,
        op: PendingOp,
    ) -> Arc<dyn ClientStream<Req, Resp>> {
        let core = Arc::new(CallCore::new(method, kind, op));
        let mut hub = self.hub.state.lock().unwrap();
        if hub.server_down || hub.client_down || hub.bound.is_none() {
            drop(hub);
            core.fail(Status::unavailable("no loopback server"));
        } else if let Some((slot, listener)) = hub.listeners.pop_front() {
            self.hub.matched.fetch_add(1, Ordering::Relaxed);
            core.accept(&slot, listener);
        } else {
            hub.waiting.push_back(Arc::clone(&core));
        }
        Arc::new(ClientEnd { core })
    }

    fn shutdown(&self) {
        let waiting = {
            let mut hub = self.hub.state.lock().unwrap();
            hub.client_down = true;
            std::mem::take(&mut hub.waiting)
        };
        for call in waiting {
            call.fail(Status::unavailable("client shut down"));
        }
    }
}

struct ServerEnd<Req, Resp> {
    core: Arc<CallCore<Req, Resp>>,
}

impl<Req, Resp> ServerStream<Req, Resp> for ServerEnd<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn method(&self) -> &str {
        &self.core.method
    }

    fn kind(&self) -> CallKind {
        self.core.kind
    }

    fn read(&self, op: PendingOp) {
        self.core.state.lock().unwrap().c2s.read(op);
    }

    fn take_message(&self) -> Option<Req> {
        self.core.state.lock().unwrap().c2s.current.take()
    }

    fn write(&self, message: Resp, op: PendingOp) {
        let mut st = self.core.state.lock().unwrap();
        let ok = st.status.is_none() && st.s2c.push(message);
        op.complete(ok);
    }

    fn finish(&self, status: Status, op: PendingOp) {
        let mut st = self.core.state.lock().unwrap();
        if st.status.is_some() {
            op.complete(false);
            return;
        }
        st.status = Some(status);
        st.s2c.close();
        st.c2s.close();
        if let Some(done) = st.server_done.take() {
            done.complete(true);
        }
        if let Some(finish) = st.client_finish.take() {
            finish.complete(true);
        }
        op.complete(true);
    }

    fn notify_when_done(&self, op: PendingOp) {
        let mut st = self.core.state.lock().unwrap();
        if st.status.is_some() {
            let ok = !st.cancelled;
            op.complete(ok);
        } else {
            st.server_done = Some(op);
        }
    }

    fn cancel(&self) {
        self.core.fail(Status::cancelled());
    }
}

struct ClientEnd<Req, Resp> {
    core: Arc<CallCore<Req, Resp>>,
}

impl<Req, Resp> ClientStream<Req, Resp> for ClientEnd<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn read(&self, op: PendingOp) {
        self.core.state.lock().unwrap().s2c.read(op);
    }

    fn take_message(&self) -> Option<Resp> {
        self.core.state.lock().unwrap().s2c.current.take()
    }

    fn write(&self, message: Req, op: PendingOp) {
        let mut st = self.core.state.lock().unwrap();
        let ok = st.status.is_none() && st.c2s.push(message);
        op.complete(ok);
    }

    fn writes_done(&self, op: PendingOp) {
        let mut st = self.core.state.lock().unwrap();
        let ok = st.status.is_none() && !st.c2s.closed;
        st.c2s.close();
        op.complete(ok);
    }

    fn finish(&self, op: PendingOp) {
        let mut st = self.core.state.lock().unwrap();
        if st.status.is_some() {
            op.complete(true);
        } else {
            st.client_finish = Some(op);
        }
    }

    fn take_status(&self) -> Option<Status> {
        self.core.state.lock().unwrap().status.clone()
    }

    fn cancel(&self) {
        self.core.fail(Status::cancelled());
    }
}
