use std::sync::Arc;

use cqrpc_core::{ConfigError, RpcResult};

use super::handler::{Handler, HandlerFactory};
use super::transport::ServerTransport;
use super::Server;
use crate::config::ServerConfig;
use crate::kind::CallKind;

/// Builder for [`Server`].
///
/// Starts from [`ServerConfig::from_env`]; setters override single fields.
/// A transport and a handler factory are required.
///
/// ```ignore
/// let server = ServerBuilder::new()
///     .address("0.0.0.0", 50051)
///     .worker_threads(4)
///     .transport(transport)
///     .handler_fn(|_method, _kind| Box::new(Echo) as Box<dyn Handler<_, _>>)
///     .build()?;
/// server.activate()?;
/// ```
pub struct ServerBuilder<Req, Resp> {
    config: ServerConfig,
    transport: Option<Arc<dyn ServerTransport<Req, Resp>>>,
    factory: Option<Arc<dyn HandlerFactory<Req, Resp>>>,
}

impl<Req, Resp> ServerBuilder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Self {
        Self::with_config(ServerConfig::from_env())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            transport: None,
            factory: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.config = self.config.ip(ip).port(port);
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config = self.config.worker_threads(n);
        self
    }

    pub fn max_pending_queue_size(mut self, n: usize) -> Self {
        self.config = self.config.max_pending_queue_size(n);
        self
    }

    pub fn channel_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config = self.config.channel_arg(key, value);
        self
    }

    pub fn num_queues(mut self, n: usize) -> Self {
        self.config = self.config.num_queues(n);
        self
    }

    pub fn listeners_per_queue(mut self, n: usize) -> Self {
        self.config = self.config.listeners_per_queue(n);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ServerTransport<Req, Resp>>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handler(mut self, factory: impl HandlerFactory<Req, Resp> + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Handler factory from a closure.
    pub fn handler_fn<F>(self, f: F) -> Self
    where
        F: Fn(&str, CallKind) -> Box<dyn Handler<Req, Resp>> + Send + Sync + 'static,
    {
        self.handler(f)
    }

    pub fn build(self) -> RpcResult<Server<Req, Resp>> {
        let transport = self
            .transport
            .ok_or(ConfigError::InvalidValue("server transport not set"))?;
        let factory = self
            .factory
            .ok_or(ConfigError::InvalidValue("handler factory not set"))?;
        Server::new(self.config, transport, factory)
    }
}

impl<Req, Resp> Default for ServerBuilder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
