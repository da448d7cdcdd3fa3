//! # cqrpc-core
//!
//! Platform-agnostic vocabulary for the cqrpc call engine.
//!
//! This crate provides:
//! - `Ref`/`WeakRef` shared ownership with once-only destruction
//! - The active-object lifecycle and its composite
//! - Completion events, tags and observers
//! - The bounded pending queue used for write backpressure
//! - Status, call ids, errors and statistics traits
//! - Logging macros and environment helpers
//!
//! It does NOT contain queues, threads or transports - those live in
//! `cqrpc-runtime` and `cqrpc`.

pub mod env;
pub mod error;
pub mod event;
pub mod id;
pub mod kprint;
pub mod lifecycle;
pub mod ownership;
pub mod pending_queue;
pub mod spinlock;
pub mod stats;
pub mod status;

pub use error::{ConfigError, RpcError, RpcResult, WorkerError};
pub use event::{
    DirectionEvent, Event, EventObserver, EventType, ObserverEvent, Tag, TransientEvent,
};
pub use id::CallId;
pub use kprint::{LogLevel, LogSink};
pub use lifecycle::{ActiveObject, CompositeActiveObject, Lifecycle, LifecycleState};
pub use ownership::{Ref, WeakRef};
pub use pending_queue::{PendingEntry, PendingKind, PendingQueue};
pub use spinlock::SpinLock;
pub use stats::{MetricsWriter, PrometheusWriter, Statistics};
pub use status::{Status, StatusCode};
