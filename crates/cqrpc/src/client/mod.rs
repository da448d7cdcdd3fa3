//! Client engine
//!
//! ```text
//!   Client (composite "client")
//!     ├── RpcPool        calls in flight; deactivate stops them
//!     ├── TimerService   call deadlines
//!     ├── Connector      opens channel_count channels on activate
//!     └── Scheduler      completion queues + worker threads
//! ```
//!
//! Calls are spread over queues and channels round-robin. Each call is
//! driven by [`ClientCall`]; results reach the application through a
//! [`ClientObserver`], either a callback or a future.

mod builder;
mod call;
mod observer;
mod transport;

pub use builder::ClientBuilder;
pub use call::{ClientCall, ClientPhase};
pub use observer::{CallbackObserver, ClientObserver, FutureObserver, ResponseFuture, UnaryFuture};
pub use transport::{ClientStream, ClientTransport};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cqrpc_core::{
    kdebug, kerror, kinfo, ActiveObject, CompositeActiveObject, Lifecycle, LifecycleState,
    MetricsWriter, Ref, RpcError, RpcResult, Statistics, Status,
};
use cqrpc_runtime::{Scheduler, TimerService};

use crate::config::ClientConfig;
use crate::kind::CallKind;
use crate::server::{PooledCall, RpcPool};
use call::CallSpec;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Overrides the configured default deadline
    pub deadline: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct ClientStats {
    pub started: AtomicU64,
    pub finished_ok: AtomicU64,
    pub finished_err: AtomicU64,
    pub timeouts: AtomicU64,
    pub rejected_writes: AtomicU64,
    pub rejected_calls: AtomicU64,
    pub observer_panics: AtomicU64,
}

/// State every call of one client shares.
pub(crate) struct ClientShared<Req, Resp> {
    pub transport: Arc<dyn ClientTransport<Req, Resp>>,
    pub pool: Arc<RpcPool>,
    pub timer: Arc<TimerService>,
    pub max_pending: Option<usize>,
    pub in_flight: AtomicUsize,
    pub stats: ClientStats,
}

impl<Req, Resp> ClientShared<Req, Resp> {
    /// Claim an in-flight slot, honouring `limit`.
    fn reserve_slot(&self, limit: Option<usize>) -> RpcResult<()> {
        let Some(limit) = limit else {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
                RpcError::TooManyCalls { limit }
            })
    }

    pub(crate) fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Opens the configured channels.
struct Connector<Req, Resp> {
    shared: Arc<ClientShared<Req, Resp>>,
    config: ClientConfig,
    lifecycle: Lifecycle,
}

impl<Req, Resp> ActiveObject for Connector<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn activate(&self) -> RpcResult<()> {
        self.lifecycle.begin_activate()?;
        for channel in 0..self.config.resolved_channels() {
            let connected = self.shared.transport.connect(
                &self.config.endpoint,
                &self.config.credentials,
                channel,
            );
            if let Err(e) = connected {
                kerror!(
                    "client: channel {} to {} failed: {}",
                    channel,
                    self.config.endpoint,
                    e
                );
                self.shared.transport.shutdown();
                self.lifecycle.reset();
                return Err(e);
            }
        }
        kinfo!(
            "client connected to {} ({} channels)",
            self.config.endpoint,
            self.config.resolved_channels()
        );
        Ok(())
    }

    fn deactivate(&self) {
        if self.lifecycle.begin_deactivate() {
            kdebug!("client: closing channels");
            self.shared.transport.shutdown();
        }
    }

    fn wait(&self) -> RpcResult<()> {
        if self.lifecycle.check_wait()? {
            self.lifecycle.finish_wait();
        }
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}

/// Asynchronous RPC client.
pub struct Client<Req, Resp> {
    config: ClientConfig,
    shared: Arc<ClientShared<Req, Resp>>,
    scheduler: Arc<Scheduler>,
    composite: CompositeActiveObject,
    next_channel: AtomicUsize,
}

impl<Req, Resp> Client<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        config: ClientConfig,
        transport: Arc<dyn ClientTransport<Req, Resp>>,
    ) -> RpcResult<Self> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(config.scheduler_config())?);
        let pool = Arc::new(RpcPool::new("client"));
        let timer = Arc::new(TimerService::new("cqrpc-timer"));
        let shared = Arc::new(ClientShared {
            transport,
            pool: Arc::clone(&pool),
            timer: Arc::clone(&timer),
            max_pending: config.max_pending_queue_size,
            in_flight: AtomicUsize::new(0),
            stats: ClientStats::default(),
        });
        let connector = Arc::new(Connector {
            shared: Arc::clone(&shared),
            config: config.clone(),
            lifecycle: Lifecycle::new(),
        });

        let composite = CompositeActiveObject::new("client");
        composite.add(pool)?;
        composite.add(timer)?;
        composite.add(connector)?;
        composite.add(Arc::clone(&scheduler) as Arc<dyn ActiveObject>)?;

        Ok(Self {
            config,
            shared,
            scheduler,
            composite,
            next_channel: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Calls started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Start a call. `observer` sees every event of it.
    ///
    /// Fails with `NotActive` before `activate`/after `deactivate`, and
    /// with `TooManyCalls` once `max_async_calls` calls are in flight.
    pub fn call(
        &self,
        method: &str,
        kind: CallKind,
        observer: Arc<dyn ClientObserver<Req, Resp>>,
        options: CallOptions,
    ) -> RpcResult<Ref<ClientCall<Req, Resp>>> {
        self.launch(method, kind, observer, options, |_| {})
    }

    /// One request, one response.
    pub fn unary(&self, method: &str, request: Req) -> RpcResult<UnaryFuture<Resp>> {
        let (observer, future) = FutureObserver::new();
        self.launch(
            method,
            CallKind::Unary,
            observer,
            CallOptions::default(),
            |call| {
                if !call.write(request) || !call.writes_done() {
                    call.abort(Status::resource_exhausted("request not accepted"));
                }
            },
        )?;
        Ok(UnaryFuture::new(future))
    }

    /// Send every request, half-close, and collect all responses.
    ///
    /// The requests are buffered before the call starts, so a long list
    /// is never charged to `max_pending_queue_size`. A request the call
    /// refuses ends it with `ResourceExhausted`.
    pub fn streaming(
        &self,
        method: &str,
        kind: CallKind,
        requests: impl IntoIterator<Item = Req>,
        options: CallOptions,
    ) -> RpcResult<ResponseFuture<Resp>> {
        let (observer, future) = FutureObserver::new();
        self.launch(method, kind, observer, options, |call| {
            for request in requests {
                if !call.write(request) {
                    kdebug!("{}: request rejected, abandoning call", call.id());
                    call.abort(Status::resource_exhausted("request not accepted"));
                    return;
                }
            }
            call.writes_done();
        })?;
        Ok(future)
    }

    /// Create and register a call, run `prime` on it, then post it.
    /// Whatever `prime` writes is buffered ahead of Start.
    fn launch<F>(
        &self,
        method: &str,
        kind: CallKind,
        observer: Arc<dyn ClientObserver<Req, Resp>>,
        options: CallOptions,
        prime: F,
    ) -> RpcResult<Ref<ClientCall<Req, Resp>>>
    where
        F: FnOnce(&ClientCall<Req, Resp>),
    {
        if !self.composite.active() {
            return Err(RpcError::NotActive);
        }
        self.shared.reserve_slot(self.config.max_async_calls)?;

        let deadline = options
            .deadline
            .or(self.config.default_deadline)
            .map(|d| Instant::now() + d);
        let channel =
            self.next_channel.fetch_add(1, Ordering::Relaxed) % self.config.resolved_channels();
        let spec = CallSpec {
            method: method.to_string(),
            kind,
            channel,
            deadline,
            observer,
        };
        let call = ClientCall::new(&self.shared, self.scheduler.next_queue(), spec);

        let member: Arc<dyn PooledCall> = Arc::clone(call.as_arc()) as Arc<dyn PooledCall>;
        self.shared.pool.add(member);
        prime(&call);
        if let Err(e) = call.post() {
            self.shared.pool.remove(call.id());
            self.shared.release_slot();
            return Err(e);
        }
        self.shared.stats.started.fetch_add(1, Ordering::Relaxed);
        Ok(call)
    }

    /// `deactivate` followed by `wait`.
    pub fn shutdown(&self) -> RpcResult<()> {
        self.composite.deactivate();
        self.composite.wait()
    }
}

impl<Req, Resp> ActiveObject for Client<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn activate(&self) -> RpcResult<()> {
        self.composite.activate()
    }

    fn deactivate(&self) {
        self.composite.deactivate();
    }

    fn wait(&self) -> RpcResult<()> {
        self.composite.wait()
    }

    fn state(&self) -> LifecycleState {
        self.composite.state()
    }
}

impl<Req, Resp> Statistics for Client<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn write(&self, w: &mut dyn MetricsWriter) {
        let stats = &self.shared.stats;
        let labels = [("side", "client")];
        w.gauge("cqrpc_calls_in_flight", &labels, self.in_flight() as i64);
        w.counter(
            "cqrpc_calls_started_total",
            &labels,
            stats.started.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_calls_finished_ok_total",
            &labels,
            stats.finished_ok.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_calls_finished_err_total",
            &labels,
            stats.finished_err.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_calls_timed_out_total",
            &labels,
            stats.timeouts.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_calls_rejected_total",
            &labels,
            stats.rejected_calls.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_writes_rejected_total",
            &labels,
            stats.rejected_writes.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_observer_panics_total",
            &labels,
            stats.observer_panics.load(Ordering::Relaxed),
        );
        self.shared.pool.write(w);
        self.shared.timer.write(w);
        self.scheduler.write(w);
    }
}

impl<Req, Resp> Drop for Client<Req, Resp> {
    fn drop(&mut self) {
        self.composite.deactivate();
        let _ = self.composite.wait();
    }
}
