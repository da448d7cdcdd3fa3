//! Scheduler configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use cqrpc_runtime::config::SchedulerConfig;
//!
//! // Defaults with env overrides
//! let config = SchedulerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = SchedulerConfig::new()
//!     .num_queues(2)
//!     .worker_threads(4);
//! ```

pub mod defaults;

use std::time::Duration;

use cqrpc_core::env::{env_get, env_get_bool, env_get_opt, env_get_str};
use cqrpc_core::ConfigError;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker threads; `None` auto-detects from available parallelism
    pub worker_threads: Option<usize>,
    /// Completion queues shared round-robin by workers
    pub num_queues: usize,
    /// Idle worker park timeout
    pub park_timeout: Duration,
    /// Worker thread name prefix
    pub thread_name: String,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CQRPC_WORKER_THREADS` - Worker thread count (unset = auto)
    /// - `CQRPC_NUM_QUEUES` - Completion queue count
    /// - `CQRPC_PARK_TIMEOUT_MS` - Idle park timeout in milliseconds
    /// - `CQRPC_THREAD_NAME` - Worker thread name prefix
    /// - `CQRPC_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            worker_threads: env_get_opt("CQRPC_WORKER_THREADS"),
            num_queues: env_get("CQRPC_NUM_QUEUES", defaults::NUM_QUEUES),
            park_timeout: Duration::from_millis(env_get(
                "CQRPC_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            thread_name: env_get_str("CQRPC_THREAD_NAME", defaults::THREAD_NAME),
            debug_logging: env_get_bool("CQRPC_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            num_queues: defaults::NUM_QUEUES,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            thread_name: defaults::THREAD_NAME.to_string(),
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = Some(n);
        self
    }

    pub fn auto_workers(mut self) -> Self {
        self.worker_threads = None;
        self
    }

    pub fn num_queues(mut self, n: usize) -> Self {
        self.num_queues = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Worker count to spawn: the configured count, or available
    /// parallelism, never fewer than one per queue.
    pub fn resolved_workers(&self) -> usize {
        let n = self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(defaults::FALLBACK_WORKERS)
        });
        n.clamp(self.num_queues.max(1), defaults::MAX_WORKERS)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_queues == 0 {
            return Err(ConfigError::InvalidValue("num_queues must be > 0"));
        }
        if self.num_queues > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_queues must be <= 256"));
        }
        match self.worker_threads {
            Some(0) => return Err(ConfigError::InvalidValue("worker_threads must be > 0")),
            Some(n) if n > defaults::MAX_WORKERS => {
                return Err(ConfigError::InvalidValue("worker_threads must be <= 256"))
            }
            _ => {}
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::InvalidValue("thread_name must not be empty"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("cqrpc Scheduler Configuration:");
        match self.worker_threads {
            Some(n) => eprintln!("  worker_threads:  {}", n),
            None => eprintln!("  worker_threads:  auto ({})", self.resolved_workers()),
        }
        eprintln!("  num_queues:      {}", self.num_queues);
        eprintln!("  park_timeout:    {:?}", self.park_timeout);
        eprintln!("  thread_name:     {}", self.thread_name);
        eprintln!("  debug_logging:   {}", self.debug_logging);
    }
}
