//! Resilient call wrapper: rate limiting, timeouts, throttles, and bounded
//! retries around every remote operation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirrorline_types::SyncError;
use serde_json::json;

use crate::context::RunContext;
use crate::event_log::EventLog;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

/// Counters accumulated across every call made through one fetcher.
#[derive(Debug, Default)]
pub struct FetchStats {
    retries: AtomicU64,
    throttle_events: AtomicU64,
    exhausted: AtomicU64,
}

impl FetchStats {
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

/// Wraps calls to one remote collaborator.
///
/// Every attempt first waits on the rate limiter, then runs under the
/// per-call timeout. Mandatory throttles are waited out without consuming the
/// retry budget; terminal errors return immediately.
#[derive(Debug)]
pub struct ResilientFetcher {
    policy: RetryPolicy,
    limiter: RateLimiter,
    events: Arc<EventLog>,
    stats: FetchStats,
}

impl ResilientFetcher {
    #[must_use]
    pub fn new(policy: RetryPolicy, limiter: RateLimiter, events: Arc<EventLog>) -> Self {
        Self {
            policy,
            limiter,
            events,
            stats: FetchStats::default(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Run `op` until it succeeds, fails terminally, or the budget runs out.
    ///
    /// # Errors
    ///
    /// Returns the terminal error unchanged, or a retry-exhausted error
    /// wrapping the last cause after `max_retries + 1` attempts.
    pub async fn call<T, F, Fut>(
        &self,
        ctx: &RunContext,
        operation: &str,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let max_retries = self.policy.max_retries;
        let mut attempt = 0u32;

        loop {
            self.limiter.acquire().await;
            let err = match tokio::time::timeout(self.policy.call_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => SyncError::timeout(format!(
                    "{operation} exceeded {}s",
                    self.policy.call_timeout.as_secs_f64()
                )),
            };

            if let Some(seconds) = err.throttle_secs {
                self.stats.throttle_events.fetch_add(1, Ordering::Relaxed);
                let wait = self.policy.throttle_delay(seconds);
                tracing::warn!(
                    operation,
                    throttle_secs = seconds,
                    wait_ms = duration_ms(wait),
                    "Remote throttle, pausing"
                );
                self.events.warn(
                    "throttle",
                    ctx.event_with(json!({
                        "operation": operation,
                        "throttle_secs": seconds,
                        "wait_secs": wait.as_secs_f64(),
                    })),
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !err.retryable {
                self.events.error(
                    "call_failed",
                    ctx.event_with(json!({
                        "operation": operation,
                        "kind": err.kind.to_string(),
                        "code": err.code,
                        "message": err.message,
                    })),
                );
                return Err(err);
            }

            if attempt >= max_retries {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                let attempts = attempt + 1;
                tracing::error!(
                    operation,
                    attempts,
                    category = %err.kind,
                    code = %err.code,
                    "Retry budget exhausted"
                );
                self.events.error(
                    "retry_exhausted",
                    ctx.event_with(json!({
                        "operation": operation,
                        "attempts": attempts,
                        "code": err.code,
                        "message": err.message,
                    })),
                );
                return Err(SyncError::retry_exhausted(attempts, err));
            }

            let delay = self.policy.delay(attempt, err.retry_after_secs);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                operation,
                attempt,
                max_retries,
                delay_ms = duration_ms(delay),
                category = %err.kind,
                code = %err.code,
                "Retryable error, will retry"
            );
            self.events.warn(
                "retry",
                ctx.event_with(json!({
                    "operation": operation,
                    "attempt": attempt,
                    "delay_secs": delay.as_secs_f64(),
                    "code": err.code,
                })),
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorline_types::error::codes;
    use mirrorline_types::state::{RunId, SourceId};
    use mirrorline_types::ErrorKind;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn ctx() -> RunContext {
        RunContext::new(RunId::new("run00001"), SourceId::new("src"))
    }

    fn fetcher(max_retries: u32) -> ResilientFetcher {
        ResilientFetcher::new(
            RetryPolicy {
                max_retries,
                throttle_jitter: Duration::ZERO,
                ..RetryPolicy::default()
            },
            RateLimiter::unlimited(),
            Arc::new(EventLog::disabled()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let f = fetcher(3);
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        let out = f
            .call(&ctx(), "get", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::network("HTTP_500", "boom"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.stats().retries(), 2);
        // 2s + 4s of backoff
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries_plus_one_attempts() {
        let f = fetcher(2);
        let calls = &AtomicU32::new(0);
        let err = f
            .call(&ctx(), "get", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::network("HTTP_503", "unavailable"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind, ErrorKind::RetryExhausted);
        assert_eq!(err.root_cause().code, "HTTP_503");
        assert_eq!(f.stats().exhausted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let f = fetcher(5);
        let calls = &AtomicU32::new(0);
        let err = f
            .call(&ctx(), "get", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::auth("HTTP_401", "denied"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind, ErrorKind::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_retryable_network_failure() {
        let f = ResilientFetcher::new(
            RetryPolicy {
                max_retries: 1,
                call_timeout: Duration::from_secs(1),
                ..RetryPolicy::default()
            },
            RateLimiter::unlimited(),
            Arc::new(EventLog::disabled()),
        );
        let calls = &AtomicU32::new(0);
        let err = f
            .call(&ctx(), "download", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, SyncError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind, ErrorKind::RetryExhausted);
        assert!(err.is_timeout());
        assert_eq!(err.root_cause().code, codes::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_does_not_consume_budget() {
        let f = fetcher(0);
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        let out = f
            .call(&ctx(), "history", move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(SyncError::throttled(30)),
                    _ => Ok("page"),
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "page");
        assert_eq!(f.stats().throttle_events(), 2);
        assert_eq!(f.stats().retries(), 0);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_drives_delay() {
        let f = fetcher(1);
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        f.call(&ctx(), "get", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SyncError::rate_limit("HTTP_429", "slow down", Some(5)))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_logged_for_retries_and_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventLog::open(dir.path()).unwrap());
        let f = ResilientFetcher::new(
            RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default()
            },
            RateLimiter::unlimited(),
            events,
        );
        let _ = f
            .call(&ctx(), "get", move || async move {
                Err::<(), _>(SyncError::network("HTTP_502", "bad gateway"))
            })
            .await;
        let errors = std::fs::read_to_string(dir.path().join(crate::event_log::ERROR_LOG)).unwrap();
        let lines: Vec<serde_json::Value> = errors
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "retry");
        assert_eq!(lines[1]["event"], "retry_exhausted");
        assert_eq!(lines[1]["data"]["run_id"], "run00001");
        assert_eq!(lines[1]["data"]["attempts"], 2);
    }
}
