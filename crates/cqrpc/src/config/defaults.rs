//! Default values for server and client configuration

/// Default listen address
pub const SERVER_IP: &str = "127.0.0.1";

/// Default listen port
pub const SERVER_PORT: u16 = 50051;

/// Listening calls armed per completion queue
pub const LISTENERS_PER_QUEUE: usize = 4;

/// Server worker thread name prefix
pub const SERVER_THREAD_NAME: &str = "cqrpc-server";

/// Default client endpoint
pub const CLIENT_ENDPOINT: &str = "127.0.0.1:50051";

/// Channels opened when `channel_count` is unset
pub const CHANNEL_COUNT: usize = 1;

/// Client worker thread name prefix
pub const CLIENT_THREAD_NAME: &str = "cqrpc-client";

/// Upper bound on listeners per queue
pub const MAX_LISTENERS_PER_QUEUE: usize = 1024;
