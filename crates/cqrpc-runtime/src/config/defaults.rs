//! Library defaults for the scheduler

/// Completion queues per scheduler
pub const NUM_QUEUES: usize = 1;

/// Upper bound on worker threads
pub const MAX_WORKERS: usize = 256;

/// Workers used when auto-detection fails
pub const FALLBACK_WORKERS: usize = 4;

/// Park timeout for idle workers (ms); bounds shutdown latency
pub const PARK_TIMEOUT_MS: u64 = 50;

/// Worker thread name prefix
pub const THREAD_NAME: &str = "cqrpc-worker";

pub const DEBUG_LOGGING: bool = false;
