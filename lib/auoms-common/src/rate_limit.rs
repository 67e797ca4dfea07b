//! Helper for the "logged at most once per minute" capacity-error policy
//! (spec.md §7).

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimitedLogger {
    period: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl RateLimitedLogger {
    pub fn new(period: Duration) -> Self {
        RateLimitedLogger {
            period,
            last_fired: Mutex::new(None),
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Returns `true` if the caller should log now (and records that it did).
    pub fn should_fire(&self) -> bool {
        let mut last = self.last_fired.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.period => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_then_suppresses_within_period() {
        let limiter = RateLimitedLogger::new(Duration::from_millis(50));
        assert!(limiter.should_fire());
        assert!(!limiter.should_fire());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.should_fire());
    }
}
