//! Exponential backoff with jitter.
//!
//! [`RetryPolicy`] knows nothing about endpoints or coalescing. Any fallible
//! async operation can be wrapped.

use crate::error::EndpointError;
use keepsake_core::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Jitter spread: each delay is scaled by a uniform factor in `[1 - J, 1 + J]`.
const JITTER_FRACTION: f64 = 0.25;

/// Backoff parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Apply +/-25% uniform jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// The result of a retried operation with its bookkeeping.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final value or the last error.
    pub result: Result<T, E>,
    /// Attempts made, at least 1.
    pub attempts: u32,
    /// Time from the first attempt to settlement, including delays.
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Drop the bookkeeping.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
        delay.mul_f64(factor)
    }

    /// Run `operation` until it succeeds, returns a non-retryable error, or
    /// runs out of attempts.
    pub async fn execute<T, E, F, Fut, R>(&self, mut operation: F, is_retryable: R) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.jittered(self.delay_for(attempt));
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
            }
        }
    }

    /// [`execute`](Self::execute) with the engine's error classification.
    pub async fn run<T, F, Fut>(&self, operation: F) -> RetryOutcome<T, EndpointError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EndpointError>>,
    {
        self.execute(operation, EndpointError::is_retryable).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..200 {
            let delay = policy.jittered(Duration::from_millis(1_000));
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = policy(3)
            .run(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EndpointError::from_status(503, "busy"))
                    } else {
                        Ok("stored")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "stored");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(outcome.elapsed >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_retries_permission_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: RetryOutcome<(), _> = policy(5)
            .run(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EndpointError::from_status(403, "forbidden"))
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Permission);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: RetryOutcome<(), _> = policy(3)
            .run(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(EndpointError::network(format!("attempt {n} refused")))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap_err().message, "attempt 3 refused");
        // 100ms + 200ms of backoff
        assert!(outcome.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let outcome = policy(0).run(|| async { Ok::<_, EndpointError>(7) }).await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.into_result().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let outcome = policy(4)
            .execute(
                || async { Err::<(), _>("always") },
                |_: &&str| false,
            )
            .await;
        assert_eq!(outcome.attempts, 1);
    }
}
