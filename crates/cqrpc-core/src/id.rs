//! Call identity

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique call identifier. Server and client calls share the
/// counter, so ids never collide inside one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl CallId {
    /// Placeholder for "no call"
    pub const NONE: CallId = CallId(0);

    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CallId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}
