//! Server engine
//!
//! ```text
//!   Server (composite "server")
//!     ├── RpcPool      live calls; deactivate stops them, wait drains
//!     ├── Acceptor     bind, then listeners_per_queue listeners per queue
//!     └── Scheduler    completion queues + worker threads
//! ```
//!
//! Children activate and deactivate in that order: the pool accepts calls
//! before the first listener is armed, and on shutdown every call is told
//! to stop before the transport closes and the queues drain.

mod builder;
mod handler;
mod pool;
mod rpc;
mod transport;

pub use builder::ServerBuilder;
pub use handler::{Handler, HandlerFactory};
pub use pool::{PooledCall, RpcPool, StopSignal};
pub use rpc::{Phase, ServerCall};
pub use transport::{CallSlot, ServerStream, ServerTransport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cqrpc_core::{
    kdebug, kerror, kinfo, ActiveObject, CompositeActiveObject, Lifecycle, LifecycleState,
    MetricsWriter, RpcResult, Statistics,
};
use cqrpc_runtime::Scheduler;

use crate::config::ServerConfig;
use rpc::Rpc;

/// Per-server call counters.
#[derive(Debug, Default)]
pub(crate) struct ServerStats {
    pub accepted: AtomicU64,
    pub finished_ok: AtomicU64,
    pub finished_err: AtomicU64,
    pub rejected_writes: AtomicU64,
    pub handler_panics: AtomicU64,
}

/// State every call of one server shares.
pub(crate) struct ServerShared<Req, Resp> {
    pub transport: Arc<dyn ServerTransport<Req, Resp>>,
    pub factory: Arc<dyn HandlerFactory<Req, Resp>>,
    pub pool: Arc<RpcPool>,
    pub max_pending: Option<usize>,
    pub stats: ServerStats,
}

impl<Req, Resp> ServerShared<Req, Resp> {
    pub(crate) fn new(
        transport: Arc<dyn ServerTransport<Req, Resp>>,
        factory: Arc<dyn HandlerFactory<Req, Resp>>,
        pool: Arc<RpcPool>,
        max_pending: Option<usize>,
    ) -> Self {
        Self {
            transport,
            factory,
            pool,
            max_pending,
            stats: ServerStats::default(),
        }
    }
}

/// Binds the transport and keeps listeners armed on every queue.
struct Acceptor<Req, Resp> {
    shared: Arc<ServerShared<Req, Resp>>,
    scheduler: Arc<Scheduler>,
    config: ServerConfig,
    lifecycle: Lifecycle,
}

impl<Req, Resp> ActiveObject for Acceptor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn activate(&self) -> RpcResult<()> {
        self.lifecycle.begin_activate()?;
        let address = self.config.address();
        if let Err(e) = self.shared.transport.bind(&address, &self.config.channel_args) {
            kerror!("server: bind {} failed: {}", address, e);
            self.lifecycle.reset();
            return Err(e);
        }

        for cq in self.scheduler.queues() {
            for _ in 0..self.config.listeners_per_queue {
                if let Err(e) = Rpc::listen(&self.shared, cq) {
                    self.shared.transport.shutdown();
                    self.lifecycle.reset();
                    return Err(e);
                }
            }
        }
        kinfo!(
            "server listening on {} ({} listeners per queue)",
            address,
            self.config.listeners_per_queue
        );
        Ok(())
    }

    fn deactivate(&self) {
        if self.lifecycle.begin_deactivate() {
            kdebug!("server: closing transport");
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

/// Asynchronous RPC server.
///
/// Built with [`ServerBuilder`]; `activate` starts accepting, `shutdown`
/// stops every call, closes the transport and joins the workers.
pub struct Server<Req, Resp> {
    config: ServerConfig,
    shared: Arc<ServerShared<Req, Resp>>,
    scheduler: Arc<Scheduler>,
    composite: CompositeActiveObject,
}

impl<Req, Resp> Server<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        config: ServerConfig,
        transport: Arc<dyn ServerTransport<Req, Resp>>,
        factory: Arc<dyn HandlerFactory<Req, Resp>>,
    ) -> RpcResult<Self> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(config.scheduler_config())?);
        let pool = Arc::new(RpcPool::new("server"));
        let shared = Arc::new(ServerShared::new(
            transport,
            factory,
            Arc::clone(&pool),
            config.max_pending_queue_size,
        ));
        let acceptor = Arc::new(Acceptor {
            shared: Arc::clone(&shared),
            scheduler: Arc::clone(&scheduler),
            config: config.clone(),
            lifecycle: Lifecycle::new(),
        });

        let composite = CompositeActiveObject::new("server");
        composite.add(pool)?;
        composite.add(acceptor)?;
        composite.add(Arc::clone(&scheduler) as Arc<dyn ActiveObject>)?;

        Ok(Self {
            config,
            shared,
            scheduler,
            composite,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn address(&self) -> String {
        self.config.address()
    }

    pub fn pool(&self) -> &Arc<RpcPool> {
        &self.shared.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Calls accepted and not yet finished.
    pub fn active_calls(&self) -> usize {
        self.shared.pool.len()
    }

    /// Calls accepted since start.
    pub fn accepted(&self) -> u64 {
        self.shared.stats.accepted.load(Ordering::Relaxed)
    }

    /// `deactivate` followed by `wait`.
    pub fn shutdown(&self) -> RpcResult<()> {
        self.composite.deactivate();
        self.composite.wait()
    }
}

impl<Req, Resp> ActiveObject for Server<Req, Resp>
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

impl<Req, Resp> Statistics for Server<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn write(&self, w: &mut dyn MetricsWriter) {
        let stats = &self.shared.stats;
        let labels = [("side", "server")];
        w.counter(
            "cqrpc_calls_accepted_total",
            &labels,
            stats.accepted.load(Ordering::Relaxed),
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
            "cqrpc_writes_rejected_total",
            &labels,
            stats.rejected_writes.load(Ordering::Relaxed),
        );
        w.counter(
            "cqrpc_call_handler_panics_total",
            &labels,
            stats.handler_panics.load(Ordering::Relaxed),
        );
        self.shared.pool.write(w);
        self.scheduler.write(w);
    }
}

impl<Req, Resp> Drop for Server<Req, Resp> {
    fn drop(&mut self) {
        self.composite.deactivate();
        let _ = self.composite.wait();
    }
}
