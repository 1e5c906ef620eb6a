//! Minimum-spacing rate limiter for one remote collaborator.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between consecutive outbound calls.
///
/// The last-call timestamp sits behind an async mutex held across the wait,
/// so concurrent callers are serialized rather than bunched.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Limiter allowing `requests_per_second` calls. Non-positive or
    /// non-finite rates disable spacing.
    #[must_use]
    pub fn per_second(requests_per_second: f64) -> Self {
        if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Self::new(Duration::from_secs_f64(1.0 / requests_per_second))
        } else {
            Self::unlimited()
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleep out the remainder of the interval, then stamp this call.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
