//! Environment variable helpers used by the config layers
//!
//! ```ignore
//! use cqrpc_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let queues: usize = env_get("CQRPC_NUM_QUEUES", 1);
//! let debug = env_get_bool("CQRPC_DEBUG", false);
//! let deadline = env_get_duration_ms("CQRPC_DEADLINE_MS");
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, anything
/// else set is false, unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` when set and parseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond count as a `Duration`. Zero is treated as unset.
#[inline]
pub fn env_get_duration_ms(key: &str) -> Option<Duration> {
    env_get_opt::<u64>(key)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__CQRPC_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
        assert_eq!(env_get_opt::<u16>("__CQRPC_TEST_UNSET_12345__"), None);
    }

    #[test]
    fn test_env_get_parsed() {
        std::env::set_var("__CQRPC_TEST_PORT__", " 8080 ");
        let port: u16 = env_get("__CQRPC_TEST_PORT__", 1);
        assert_eq!(port, 8080);

        std::env::set_var("__CQRPC_TEST_BAD__", "eighty");
        let port: u16 = env_get("__CQRPC_TEST_BAD__", 1);
        assert_eq!(port, 1);
    }

    #[test]
    fn test_env_get_bool() {
        assert!(env_get_bool("__CQRPC_TEST_UNSET_12345__", true));
        std::env::set_var("__CQRPC_TEST_FLAG__", "Yes");
        assert!(env_get_bool("__CQRPC_TEST_FLAG__", false));
        std::env::set_var("__CQRPC_TEST_FLAG_OFF__", "nope");
        assert!(!env_get_bool("__CQRPC_TEST_FLAG_OFF__", true));
    }

    #[test]
    fn test_env_get_duration() {
        std::env::set_var("__CQRPC_TEST_MS__", "250");
        assert_eq!(
            env_get_duration_ms("__CQRPC_TEST_MS__"),
            Some(Duration::from_millis(250))
        );
        std::env::set_var("__CQRPC_TEST_MS_ZERO__", "0");
        assert_eq!(env_get_duration_ms("__CQRPC_TEST_MS_ZERO__"), None);
    }
}
