//! Bounded exponential retry for store operations
//!
//! Every attempt is bounded by `attempt_timeout`; an attempt that runs out
//! of time is reported as [`StoreError::Timeout`] and retried like any
//! other transient failure. Non-transient errors end the loop at once.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::store::StoreError;

/// Retry schedule for one store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubles after each retry
    pub initial_backoff: Duration,
    /// Upper bound on a single sleep
    pub max_backoff: Duration,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff slept after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Worst-case wall time of a fully exhausted retry loop.
    pub fn budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeps: Duration = (1..attempts).map(|a| self.backoff_after(a)).sum();
        self.attempt_timeout.saturating_mul(attempts) + sleeps
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, StoreError>,
    /// Attempts actually made (>= 1)
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Retries beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `op` under `policy`.
///
/// `target` names the item being written or read and only appears in logs.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, target: &str, mut op: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        let err = match result {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= max_attempts {
            return Retried {
                result: Err(err),
                attempts: attempt,
            };
        }

        let backoff = policy.backoff_after(attempt);
        warn!(
            target_item = target,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Store operation failed, retrying"
        );
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(25),
            attempt_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_after(1), Duration::from_millis(10));
        assert_eq!(p.backoff_after(2), Duration::from_millis(20));
        assert_eq!(p.backoff_after(3), Duration::from_millis(25));
        assert_eq!(p.backoff_after(40), Duration::from_millis(25));
    }

    #[test]
    fn test_budget_covers_all_attempts() {
        // 4 timeouts of 100ms + sleeps 10 + 20 + 25
        assert_eq!(policy().budget(), Duration::from_millis(455));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let out = retry(&policy(), "AAPL#1m", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Throttled)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(out.result, Ok(7));
        assert_eq!(out.attempts, 3);
        assert_eq!(out.retries(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let out: Retried<()> = retry(&policy(), "AAPL#1m", || async {
            Err(StoreError::Unavailable("down".into()))
        })
        .await;

        assert_eq!(out.result, Err(StoreError::Unavailable("down".into())));
        assert_eq!(out.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_not_retried() {
        let out: Retried<()> =
            retry(&policy(), "AAPL#1m", || async { Err(StoreError::Backend("bad".into())) }).await;

        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(StoreError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let out = retry(&policy(), "AAPL#1h", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, StoreError>("done")
            }
        })
        .await;

        assert_eq!(out.result, Ok("done"));
        assert_eq!(out.attempts, 2);
    }
}
