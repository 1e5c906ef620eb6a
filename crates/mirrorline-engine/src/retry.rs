//! Retry policy and backoff scheduling.

use std::time::Duration;

use rand::Rng;

/// Upper bound for any computed backoff, hint-driven or exponential.
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Retry configuration shared by every remote call in one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Cap applied to every backoff delay.
    pub max_delay: Duration,
    /// Per-call timeout; expiry counts as a retryable network failure.
    pub call_timeout: Duration,
    /// Added on top of a mandatory platform throttle.
    pub throttle_extra: Duration,
    /// Upper bound of the random jitter added to a mandatory throttle.
    pub throttle_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_delay: Duration::from_secs(MAX_BACKOFF_SECS),
            call_timeout: Duration::from_secs(30),
            throttle_extra: Duration::ZERO,
            throttle_jitter: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based), honoring a server hint.
    #[must_use]
    pub fn delay(&self, attempt: u32, hint_secs: Option<u64>) -> Duration {
        backoff_delay(attempt, hint_secs).min(self.max_delay)
    }

    /// Wait for a mandatory throttle: the directed pause plus the configured
    /// extra plus random jitter. Never capped.
    #[must_use]
    pub fn throttle_delay(&self, seconds: u64) -> Duration {
        let jitter_secs = self.throttle_jitter.as_secs_f64();
        let jitter = if jitter_secs > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=jitter_secs))
        } else {
            Duration::ZERO
        };
        Duration::from_secs(seconds) + self.throttle_extra + jitter
    }
}

/// Backoff for retry `attempt` (0-based).
///
/// A positive `hint_secs` wins but is still capped at [`MAX_BACKOFF_SECS`];
/// otherwise `2^(attempt + 1)` seconds, capped the same way.
#[must_use]
pub fn backoff_delay(attempt: u32, hint_secs: Option<u64>) -> Duration {
    if let Some(hint) = hint_secs.filter(|h| *h > 0) {
        return Duration::from_secs(hint.min(MAX_BACKOFF_SECS));
    }
    let exp = 2u64
        .checked_pow(attempt.saturating_add(1))
        .unwrap_or(u64::MAX);
    Duration::from_secs(exp.min(MAX_BACKOFF_SECS))
}

/// Whether an HTTP status signals a transient, retryable condition.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}
