//! Retry Logic
//!
//! Bounded retry with backoff for transient backend failures. The router runs
//! every member call through [`RetryPolicy::retry_if`] inside the backend's
//! circuit breaker, so an exhausted retry sequence counts as exactly one
//! breaker failure.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_prediction_orchestrator::routing::RetryPolicy;
//! # #[tokio::main]
//! # async fn main() {
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(20));
//! let result: Result<u32, String> = policy.retry(|| async { Ok(7) }).await;
//! assert_eq!(result, Ok(7));
//! # }
//! ```

use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: usize,
    /// Delay schedule between attempts.
    pub strategy: RetryStrategy,
}

/// Retry backoff strategy
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff (delay doubles each time)
    Exponential {
        /// Delay before the second attempt.
        initial_delay: Duration,
        /// Upper bound on any single delay.
        max_delay: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

impl RetryPolicy {
    /// Create policy with fixed delay
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Fixed(delay),
        }
    }

    /// Create policy with exponential backoff capped at `initial_delay * 32`.
    pub fn exponential(max_attempts: usize, initial_delay: Duration) -> Self {
        Self::exponential_capped(max_attempts, initial_delay, initial_delay * 32)
    }

    /// Create policy with exponential backoff and an explicit cap.
    pub fn exponential_capped(
        max_attempts: usize,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier: 2.0,
            },
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Execute operation with retries on every error.
    pub async fn retry<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(f, |_| true).await
    }

    /// Execute operation, retrying only errors for which `should_retry` is true.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut f: F, mut should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "retry: operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if attempt >= max_attempts || !should_retry(&e) {
                        warn!(attempts = attempt, error = %e, "retry: giving up");
                        return Err(e);
                    }
                    debug!(
                        attempt = attempt,
                        max = max_attempts,
                        error = %e,
                        "retry: operation failed"
                    );
                    let delay = with_jitter(self.calculate_delay(attempt));
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let millis = initial_delay.as_millis() as f64 * multiplier.powi(exponent);
                let capped = millis.min(max_delay.as_millis() as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

/// Add up to 25% random delay so concurrent retries against one backend
/// do not land together.
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = (duration.as_millis() / 4) as u64;
    if quarter == 0 {
        return duration;
    }
    duration + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let c = calls.clone();
        let result: Result<&str, String> = policy
            .retry(|| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        let c = calls.clone();
        let result: Result<(), String> = policy
            .retry(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_if_skips_permanent_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let c = calls.clone();
        let result: Result<(), String> = policy
            .retry_if(
                || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("permanent".to_string())
                    }
                },
                |e| e != "permanent",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential_capped(
            10,
            Duration::from_millis(100),
            Duration::from_millis(250),
        );
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(25));
        }
        assert_eq!(with_jitter(Duration::from_millis(3)), Duration::from_millis(3));
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts.max(1), 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }
}
