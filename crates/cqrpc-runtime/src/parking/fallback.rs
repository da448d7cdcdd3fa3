//! Condvar parking for platforms without futex

use super::WorkerParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct FallbackParking {
    /// true = wake pending
    pending: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn signal(&self) {
        *self.pending.lock().unwrap() = true;
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.pending.lock().unwrap();
        if *guard {
            *guard = false;
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        guard = match timeout {
            Some(t) => self.condvar.wait_timeout(guard, t).unwrap().0,
            None => self.condvar.wait(guard).unwrap(),
        };
        self.parked.fetch_sub(1, Ordering::SeqCst);

        std::mem::replace(&mut *guard, false)
    }

    fn wake_one(&self) {
        self.signal();
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        self.signal();
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
