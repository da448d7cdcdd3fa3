//! # cqrpc
//!
//! Embeddable asynchronous RPC call engine.
//!
//! Every asynchronous operation of a call (accept, read, write, finish)
//! is armed on a completion queue with a tag; worker threads drain the
//! queues and route each `(tag, ok)` back to the call's state machine.
//! Application code plugs in as a [`Handler`] on the server side and a
//! [`ClientObserver`] (callback or future) on the client side. Wire
//! transports plug in below through [`ServerTransport`] and
//! [`ClientTransport`]; [`loopback`] provides an in-process pair.
//!
//! # Quick Start
//!
//! ```ignore
//! use cqrpc::{loopback, ActiveObject, ClientBuilder, Handler, ServerBuilder, ServerCall};
//!
//! struct Echo;
//! impl Handler<String, String> for Echo {
//!     fn on_request(&mut self, call: &ServerCall<String, String>, req: String) {
//!         call.write(req);
//!     }
//! }
//!
//! let (st, ct) = loopback::pair::<String, String>();
//! let server = ServerBuilder::new()
//!     .transport(st)
//!     .handler_fn(|_, _| Box::new(Echo) as Box<dyn Handler<_, _>>)
//!     .build()?;
//! server.activate()?;
//!
//! let client = ClientBuilder::new().transport(ct).build()?;
//! client.activate()?;
//! let reply = futures::executor::block_on(client.unary("/echo", "hi".into())?);
//! ```
//!
//! # Environment Variables
//!
//! See [`config`] for the server and client variables and
//! [`cqrpc_runtime::config`] for the scheduler ones.

pub mod client;
pub mod config;
pub mod kind;
pub mod loopback;
pub mod server;

pub use client::{
    CallOptions, CallbackObserver, Client, ClientBuilder, ClientCall, ClientObserver,
    ClientPhase, ClientStream, ClientTransport, FutureObserver, ResponseFuture, UnaryFuture,
};
pub use config::{ChannelArgs, ClientConfig, Credentials, ServerConfig};
pub use kind::CallKind;
pub use server::{
    CallSlot, Handler, HandlerFactory, Phase, PooledCall, RpcPool, Server, ServerBuilder,
    ServerCall, ServerStream, ServerTransport, StopSignal,
};

pub use cqrpc_core::{
    kdebug, kerror, kinfo, ktrace, kwarn, ActiveObject, CallId, ConfigError, EventType,
    LifecycleState, MetricsWriter, PrometheusWriter, RpcError, RpcResult, Statistics, Status,
    StatusCode,
};
pub use cqrpc_core::env;
pub use cqrpc_core::stats::render_prometheus;
pub use cqrpc_runtime::{Scheduler, SchedulerConfig};
