use std::time::Duration;

use cqrpc_core::env::{env_get_duration_ms, env_get_opt, env_get_str};
use cqrpc_core::ConfigError;
use cqrpc_runtime::SchedulerConfig;

use super::{defaults, Credentials};

/// Client engine configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    /// Channels to open (None = 1)
    pub channel_count: Option<usize>,
    /// Worker threads (None = auto-detect)
    pub worker_thread_count: Option<usize>,
    /// Calls allowed in flight at once (None = unlimited)
    pub max_async_calls: Option<usize>,
    /// Per-call pending write bound (None = unbounded)
    pub max_pending_queue_size: Option<usize>,
    /// Deadline applied to calls that do not set their own
    pub default_deadline: Option<Duration>,
}

impl ClientConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let credentials = match std::env::var("CQRPC_CLIENT_TOKEN") {
            Ok(token) if !token.is_empty() => Credentials::Token(token),
            _ => Credentials::Insecure,
        };
        Self {
            endpoint: env_get_str("CQRPC_CLIENT_ENDPOINT", defaults::CLIENT_ENDPOINT),
            credentials,
            channel_count: env_get_opt("CQRPC_CLIENT_CHANNELS"),
            worker_thread_count: env_get_opt("CQRPC_CLIENT_WORKERS"),
            max_async_calls: env_get_opt("CQRPC_MAX_ASYNC_CALLS"),
            max_pending_queue_size: env_get_opt("CQRPC_MAX_PENDING"),
            default_deadline: env_get_duration_ms("CQRPC_DEADLINE_MS"),
        }
    }

    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            endpoint: defaults::CLIENT_ENDPOINT.to_string(),
            credentials: Credentials::Insecure,
            channel_count: None,
            worker_thread_count: None,
            max_async_calls: None,
            max_pending_queue_size: None,
            default_deadline: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn channel_count(mut self, n: usize) -> Self {
        self.channel_count = Some(n);
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_thread_count = Some(n);
        self
    }

    pub fn max_async_calls(mut self, n: usize) -> Self {
        self.max_async_calls = Some(n);
        self
    }

    pub fn max_pending_queue_size(mut self, n: usize) -> Self {
        self.max_pending_queue_size = Some(n);
        self
    }

    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    /// Channels to open.
    pub fn resolved_channels(&self) -> usize {
        self.channel_count.unwrap_or(defaults::CHANNEL_COUNT)
    }

    /// Scheduler settings derived from this config.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let config = SchedulerConfig::from_env().thread_name(defaults::CLIENT_THREAD_NAME);
        match self.worker_thread_count {
            Some(n) => config.worker_threads(n),
            None => config.auto_workers(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::InvalidValue("endpoint must not be empty"));
        }
        if self.channel_count == Some(0) {
            return Err(ConfigError::InvalidValue("channel_count must be > 0"));
        }
        if self.worker_thread_count == Some(0) {
            return Err(ConfigError::InvalidValue("worker_thread_count must be > 0"));
        }
        if self.max_async_calls == Some(0) {
            return Err(ConfigError::InvalidValue("max_async_calls must be > 0"));
        }
        if self.default_deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidValue("default_deadline must be > 0"));
        }
        self.scheduler_config().validate()
    }

    pub fn print(&self) {
        eprintln!("cqrpc Client Configuration:");
        eprintln!("  endpoint:         {}", self.endpoint);
        eprintln!("  credentials:      {:?}", self.credentials);
        eprintln!("  channels:         {}", self.resolved_channels());
        match self.worker_thread_count {
            Some(n) => eprintln!("  worker_threads:   {}", n),
            None => eprintln!("  worker_threads:   auto"),
        }
        match self.max_async_calls {
            Some(n) => eprintln!("  max_async_calls:  {}", n),
            None => eprintln!("  max_async_calls:  unlimited"),
        }
        match self.max_pending_queue_size {
            Some(n) => eprintln!("  max_pending:      {}", n),
            None => eprintln!("  max_pending:      unbounded"),
        }
        match self.default_deadline {
            Some(d) => eprintln!("  default_deadline: {:?}", d),
            None => eprintln!("  default_deadline: none"),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ClientConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolved_channels(), 1);
        assert_eq!(config.credentials, Credentials::Insecure);
    }

    #[test]
    fn test_invalid_values() {
        assert!(ClientConfig::new().endpoint("").validate().is_err());
        assert!(ClientConfig::new().channel_count(0).validate().is_err());
        assert!(ClientConfig::new().max_async_calls(0).validate().is_err());
        assert!(ClientConfig::new()
            .default_deadline(Duration::ZERO)
            .validate()
            .is_err());
    }
}
