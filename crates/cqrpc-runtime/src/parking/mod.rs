//! Worker parking for idle completion-queue consumers
//!
//! Workers park when their queue has nothing ready; posting a completion
//! calls `wake_one()`, draining or shutdown calls `wake_all()`.
//!
//! Wakes are sticky: a wake delivered while nobody is parked is kept and
//! consumed by the next `park()`, so a completion posted between a
//! worker's empty poll and its park is never slept through.

use std::time::Duration;

pub trait WorkerParking: Send + Sync {
    /// Park until woken or `timeout` elapses.
    ///
    /// Returns `true` if a wake was consumed. Callers re-check their queue
    /// regardless of the result.
    fn park(&self, timeout: Option<Duration>) -> bool;

    fn wake_one(&self);

    fn wake_all(&self);

    /// Number of currently parked workers (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = new_parking();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_before_park_is_kept() {
        let parking = new_parking();
        parking.wake_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Consumed: the next park times out
        assert!(!parking.park(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_wake_one_parked() {
        let parking = Arc::new(PlatformParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || {
            let start = Instant::now();
            parking2.park(Some(Duration::from_secs(10)));
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        parking.wake_one();

        let slept = handle.join().unwrap();
        assert!(slept < Duration::from_secs(5));
    }
}
