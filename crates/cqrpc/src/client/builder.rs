use std::sync::Arc;
use std::time::Duration;

use cqrpc_core::{ConfigError, RpcResult};

use super::transport::ClientTransport;
use super::Client;
use crate::config::{ClientConfig, Credentials};

/// Builder for [`Client`].
///
/// Starts from [`ClientConfig::from_env`]; a transport is required.
pub struct ClientBuilder<Req, Resp> {
    config: ClientConfig,
    transport: Option<Arc<dyn ClientTransport<Req, Resp>>>,
}

impl<Req, Resp> ClientBuilder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Self {
        Self::with_config(ClientConfig::from_env())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config = self.config.endpoint(endpoint);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config = self.config.credentials(credentials);
        self
    }

    pub fn channel_count(mut self, n: usize) -> Self {
        self.config = self.config.channel_count(n);
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config = self.config.worker_threads(n);
        self
    }

    pub fn max_async_calls(mut self, n: usize) -> Self {
        self.config = self.config.max_async_calls(n);
        self
    }

    pub fn max_pending_queue_size(mut self, n: usize) -> Self {
        self.config = self.config.max_pending_queue_size(n);
        self
    }

    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.config = self.config.default_deadline(deadline);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ClientTransport<Req, Resp>>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> RpcResult<Client<Req, Resp>> {
        let transport = self
            .transport
            .ok_or(ConfigError::InvalidValue("client transport not set"))?;
        Client::new(self.config, transport)
    }
}

impl<Req, Resp> Default for ClientBuilder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
