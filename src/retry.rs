//! Retry policies and the single helper that executes them.

use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounded retry policy with exponential backoff and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per further attempt.
    pub multiplier: f64,
    /// Upper bound of the random jitter added to every delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Creates a policy with exponential growth.
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, jitter: Duration) -> Self {
        Self { max_attempts, base_delay, multiplier, jitter }
    }

    /// Retries database updates hit by lock contention: 0.7s * 1.5^(n-1) + U(0, 0.3s).
    pub fn db_contention(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_millis(700), 1.5, Duration::from_millis(300))
    }

    /// Policy with no waiting at all, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.round() as u64)
    }

    /// Delay to wait after the given failed attempt (1-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay_for(attempt) + jitter(self.jitter)
    }
}

/// Returns a random duration in `0..=max`.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Sleeps for `base` plus a random amount between `min_extra` and `max_extra`.
pub async fn pause(base: Duration, min_extra: Duration, max_extra: Duration) {
    let extra = min_extra + jitter(max_extra.saturating_sub(min_extra));
    let total = base + extra;
    if total.is_zero() {
        return;
    }
    debug!("Pausing {}ms", total.as_millis());
    tokio::time::sleep(total).await;
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. The last error is returned on exhaustion.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, mut is_retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let wait = policy.delay_for(attempt);
                debug!("Attempt {}/{} failed, retrying in {}ms", attempt, policy.max_attempts, wait.as_millis());
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_db_contention_backoff_grows() {
        let policy = RetryPolicy::db_contention(3);
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(700));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(1050));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(1575));
    }

    #[test]
    fn test_delay_stays_within_jitter_bound() {
        let policy = RetryPolicy::db_contention(3);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(700));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_zero_jitter() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::db_contention(3);

        let result: Result<&str, &str> = retry(
            &policy,
            |_| true,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("locked")
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::db_contention(3);

        let result: Result<(), String> = retry(
            &policy,
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("locked #{}", attempt)) }
            },
        )
        .await;

        assert_eq!(result, Err("locked #3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);

        let result: Result<(), &str> = retry(
            &policy,
            |e| *e == "locked",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("broken") }
            },
        )
        .await;

        assert_eq!(result, Err("broken"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
