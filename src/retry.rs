//! Retry with exponential backoff and jitter.
//!
//! Discovery and the record write are each wrapped in their own retry loop.
//! An exhausted loop hands back the last error unchanged, so callers see the
//! same error kinds as for a single attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::Result;

/// Backoff policy bounding a retry loop.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Upper bound for a single delay between attempts.
    pub max_interval: Duration,
    /// Total time after which no further attempt is started.
    pub max_elapsed: Duration,
    /// Growth factor applied to the delay after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(600),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given ceilings and default growth.
    #[must_use]
    pub fn new(max_elapsed: Duration, max_interval: Duration) -> Self {
        Self {
            max_interval,
            max_elapsed,
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// Errors that are not retryable (see [`crate::Error::is_retryable`]) are
/// returned after the first attempt.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut interval = policy.initial_interval.min(policy.max_interval);

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !e.is_retryable() {
            return Err(e);
        }

        let delay = backoff_delay(policy, interval);

        if start.elapsed() + delay > policy.max_elapsed {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed, giving up"
            );
            return Err(e);
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "operation failed, retrying"
        );

        tokio::time::sleep(delay).await;

        interval = Duration::from_secs_f64(
            (interval.as_secs_f64() * policy.multiplier).min(policy.max_interval.as_secs_f64()),
        );
    }
}

// Jitter may not push a single wait past the cap.
fn backoff_delay(policy: &RetryPolicy, interval: Duration) -> Duration {
    jittered(interval).min(policy.max_interval)
}

// 0.5x to 1.5x of the interval.
fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::Error;

    fn fast_policy(max_elapsed: Duration) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            max_elapsed,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result = retry_with_backoff(&RetryPolicy::default(), "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_with_backoff(&fast_policy(Duration::from_secs(5)), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::discovery("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = fast_policy(Duration::from_millis(50));
        let result: Result<()> = retry_with_backoff(&policy, "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(Error::discovery(format!("attempt {n}")))
            }
        })
        .await;

        let attempts = count.load(Ordering::SeqCst);
        assert!(attempts > 1);
        match result {
            Err(Error::Discovery(msg)) => assert_eq!(msg, format!("attempt {}", attempts - 1)),
            other => panic!("expected discovery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_ceiling_makes_a_single_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(Duration::ZERO), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::discovery("down"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Discovery(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(Duration::from_secs(5)), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::not_found("Service", "default", "api"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(interval);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn delay_never_exceeds_max_interval() {
        let policy = RetryPolicy::default();
        let longest = (0..1000)
            .map(|_| backoff_delay(&policy, policy.max_interval))
            .max()
            .unwrap();

        assert!(longest <= policy.max_interval, "longest wait {longest:?}");
        assert!(longest >= policy.max_interval / 2);
    }

    #[test]
    fn policy_new_keeps_defaults() {
        let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(5));
        assert_eq!(policy.max_elapsed, Duration::from_secs(30));
        assert_eq!(policy.max_interval, Duration::from_secs(5));
        assert_eq!(policy.initial_interval, RetryPolicy::default().initial_interval);
    }
}
