//! A timer shared by a session's cooperating tasks: any direction seeing
//! traffic resets it, and whichever task is idle-waiting counts ticks
//! against it (§4.8 "Idle teardown").

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct SharedIdleTimer {
    elapsed_millis: AtomicU64,
    timeout: Duration,
}

impl SharedIdleTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            elapsed_millis: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn reset(&self) {
        self.elapsed_millis.store(0, Ordering::Relaxed);
    }

    pub fn count(&self, tick: Duration) {
        self.elapsed_millis
            .fetch_add(tick.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn timed_out(&self) -> bool {
        self.elapsed_millis.load(Ordering::Relaxed) >= self.timeout.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_trips_after_timeout() {
        let timer = SharedIdleTimer::new(Duration::from_millis(100));
        timer.count(Duration::from_millis(60));
        assert!(!timer.timed_out());
        timer.count(Duration::from_millis(60));
        assert!(timer.timed_out());
    }

    #[test]
    fn test_reset_clears_accumulated_idle() {
        let timer = SharedIdleTimer::new(Duration::from_millis(100));
        timer.count(Duration::from_millis(90));
        timer.reset();
        assert!(!timer.timed_out());
    }
}
