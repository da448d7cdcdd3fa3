//! Error types for the call engine
//!
//! Only synchronous misuse is an error. A transport completion with
//! `ok == false` is protocol input, a full pending queue is a `false`
//! return, and a failed call ends with a [`Status`](crate::Status).

use core::fmt;

/// Result type for engine operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors that can occur in engine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// `activate()` called on an object that is not NotActive
    AlreadyActive,

    /// Operation requires an active object
    NotActive,

    /// `wait()` called on an object that was never deactivated
    StillActive,

    /// Completion queue was shut down and fully drained
    QueueShutdown,

    /// Client refused a call because `max_async_calls` are in flight
    TooManyCalls { limit: usize },

    /// Transport refused an operation (bind, connect)
    Transport(String),

    /// Invalid configuration
    Config(ConfigError),

    /// Worker thread error
    Worker(WorkerError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::AlreadyActive => write!(f, "object already active"),
            RpcError::NotActive => write!(f, "object not active"),
            RpcError::StillActive => write!(f, "wait() called before deactivate()"),
            RpcError::QueueShutdown => write!(f, "completion queue shut down"),
            RpcError::TooManyCalls { limit } => {
                write!(f, "too many outstanding calls (limit {})", limit)
            }
            RpcError::Transport(msg) => write!(f, "transport error: {}", msg),
            RpcError::Config(e) => write!(f, "{}", e),
            RpcError::Worker(e) => write!(f, "worker error: {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked outside of event dispatch
    Panicked,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

impl From<WorkerError> for RpcError {
    fn from(e: WorkerError) -> Self {
        RpcError::Worker(e)
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for RpcError {
    fn from(e: ConfigError) -> Self {
        RpcError::Config(e)
    }
}
