//! # cqrpc-runtime
//!
//! Threads and queues behind the cqrpc call engine.
//!
//! This crate provides:
//! - Completion queues with drain-safe shutdown
//! - Worker threads that dispatch completions, isolating handler panics
//! - Futex-based worker parking (condvar fallback off Linux)
//! - A deadline timer service that completes armed operations on expiry
//! - The `Scheduler` active object tying queues and workers together

pub mod completion_queue;
pub mod config;
pub mod parking;
pub mod scheduler;
pub mod timer;
pub mod worker;

// Re-exports
pub use completion_queue::{Completion, CompletionQueue, PendingOp};
pub use config::SchedulerConfig;
pub use parking::{new_parking, WorkerParking};
pub use scheduler::Scheduler;
pub use timer::{TimerHandle, TimerService};
pub use worker::{panic_message, WorkerPool, WorkerStats};
