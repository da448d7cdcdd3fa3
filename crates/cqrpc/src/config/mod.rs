//! Server and client configuration
//!
//! Both follow the same shape as [`SchedulerConfig`](cqrpc_runtime::SchedulerConfig):
//! `new()` for library defaults, `from_env()` for defaults plus
//! environment overrides, chainable setters, `validate()` and `print()`.
//!
//! # Environment Variables
//!
//! | Variable | Applies to | Default |
//! |---|---|---|
//! | `CQRPC_SERVER_IP` | server | 127.0.0.1 |
//! | `CQRPC_SERVER_PORT` | server | 50051 |
//! | `CQRPC_SERVER_WORKERS` | server | auto |
//! | `CQRPC_MAX_PENDING` | server, client | unbounded |
//! | `CQRPC_LISTENERS_PER_QUEUE` | server | 4 |
//! | `CQRPC_NUM_QUEUES` | server, client | 1 |
//! | `CQRPC_CLIENT_ENDPOINT` | client | 127.0.0.1:50051 |
//! | `CQRPC_CLIENT_TOKEN` | client | (insecure) |
//! | `CQRPC_CLIENT_CHANNELS` | client | 1 |
//! | `CQRPC_CLIENT_WORKERS` | client | auto |
//! | `CQRPC_MAX_ASYNC_CALLS` | client | unlimited |
//! | `CQRPC_DEADLINE_MS` | client | none |

pub mod defaults;
mod client;
mod server;

pub use client::ClientConfig;
pub use server::ServerConfig;

use std::collections::BTreeMap;
use std::fmt;

/// Transport channel arguments, passed through to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelArgs {
    args: BTreeMap<String, String>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for ChannelArgs
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Client credentials handed to the transport on connect.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Insecure,
    /// Bearer token
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Insecure => f.write_str("Insecure"),
            Credentials::Token(_) => f.write_str("Token(***)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_args() {
        let mut args = ChannelArgs::new();
        args.set("max_message_size", "4096").set("keepalive_ms", "1000");
        assert_eq!(args.get("keepalive_ms"), Some("1000"));
        assert_eq!(args.len(), 2);

        let collected: ChannelArgs = [("a", "1")].into_iter().collect();
        assert_eq!(collected.iter().collect::<Vec<_>>(), vec![("a", "1")]);
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::Token("secret".into());
        assert_eq!(format!("{:?}", creds), "Token(***)");
        assert_eq!(Credentials::default(), Credentials::Insecure);
    }
}
