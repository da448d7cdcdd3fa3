use cqrpc_core::env::{env_get, env_get_opt, env_get_str};
use cqrpc_core::ConfigError;
use cqrpc_runtime::SchedulerConfig;

use super::{defaults, ChannelArgs};

/// Server engine configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    /// Worker threads (None = auto-detect)
    pub worker_thread_count: Option<usize>,
    pub channel_args: ChannelArgs,
    /// Per-call pending write bound (None = unbounded)
    pub max_pending_queue_size: Option<usize>,
    pub num_queues: usize,
    pub listeners_per_queue: usize,
}

impl ServerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            ip: env_get_str("CQRPC_SERVER_IP", defaults::SERVER_IP),
            port: env_get("CQRPC_SERVER_PORT", defaults::SERVER_PORT),
            worker_thread_count: env_get_opt("CQRPC_SERVER_WORKERS"),
            channel_args: ChannelArgs::new(),
            max_pending_queue_size: env_get_opt("CQRPC_MAX_PENDING"),
            num_queues: env_get(
                "CQRPC_NUM_QUEUES",
                cqrpc_runtime::config::defaults::NUM_QUEUES,
            ),
            listeners_per_queue: env_get(
                "CQRPC_LISTENERS_PER_QUEUE",
                defaults::LISTENERS_PER_QUEUE,
            ),
        }
    }

    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            ip: defaults::SERVER_IP.to_string(),
            port: defaults::SERVER_PORT,
            worker_thread_count: None,
            channel_args: ChannelArgs::new(),
            max_pending_queue_size: None,
            num_queues: cqrpc_runtime::config::defaults::NUM_QUEUES,
            listeners_per_queue: defaults::LISTENERS_PER_QUEUE,
        }
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_thread_count = Some(n);
        self
    }

    pub fn channel_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.channel_args.set(key, value);
        self
    }

    pub fn max_pending_queue_size(mut self, n: usize) -> Self {
        self.max_pending_queue_size = Some(n);
        self
    }

    pub fn num_queues(mut self, n: usize) -> Self {
        self.num_queues = n;
        self
    }

    pub fn listeners_per_queue(mut self, n: usize) -> Self {
        self.listeners_per_queue = n;
        self
    }

    /// `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Scheduler settings derived from this config.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let config = SchedulerConfig::from_env()
            .num_queues(self.num_queues)
            .thread_name(defaults::SERVER_THREAD_NAME);
        match self.worker_thread_count {
            Some(n) => config.worker_threads(n),
            None => config.auto_workers(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip.is_empty() {
            return Err(ConfigError::InvalidValue("ip must not be empty"));
        }
        if self.worker_thread_count == Some(0) {
            return Err(ConfigError::InvalidValue("worker_thread_count must be > 0"));
        }
        if self.num_queues == 0 {
            return Err(ConfigError::InvalidValue("num_queues must be > 0"));
        }
        if self.listeners_per_queue == 0 {
            return Err(ConfigError::InvalidValue("listeners_per_queue must be > 0"));
        }
        if self.listeners_per_queue > defaults::MAX_LISTENERS_PER_QUEUE {
            return Err(ConfigError::InvalidValue(
                "listeners_per_queue must be <= 1024",
            ));
        }
        self.scheduler_config().validate()
    }

    pub fn print(&self) {
        eprintln!("cqrpc Server Configuration:");
        eprintln!("  address:              {}", self.address());
        match self.worker_thread_count {
            Some(n) => eprintln!("  worker_threads:       {}", n),
            None => eprintln!("  worker_threads:       auto"),
        }
        match self.max_pending_queue_size {
            Some(n) => eprintln!("  max_pending:          {}", n),
            None => eprintln!("  max_pending:          unbounded"),
        }
        eprintln!("  num_queues:           {}", self.num_queues);
        eprintln!("  listeners_per_queue:  {}", self.listeners_per_queue);
        for (k, v) in self.channel_args.iter() {
            eprintln!("  arg {}={}", k, v);
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ServerConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "127.0.0.1:50051");
        assert_eq!(config.max_pending_queue_size, None);
    }

    #[test]
    fn test_builder_and_validation() {
        let config = ServerConfig::new()
            .ip("0.0.0.0")
            .port(7000)
            .worker_threads(2)
            .num_queues(2)
            .max_pending_queue_size(8)
            .channel_arg("keepalive_ms", "500");
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "0.0.0.0:7000");
        assert_eq!(config.scheduler_config().resolved_workers(), 2);

        assert!(ServerConfig::new().listeners_per_queue(0).validate().is_err());
        assert!(ServerConfig::new().worker_threads(0).validate().is_err());
        assert!(ServerConfig::new().ip("").validate().is_err());
    }
}
