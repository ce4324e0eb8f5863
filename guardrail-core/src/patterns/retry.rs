//! Retry and backoff for transient failures
//!
//! Shared by the request client and the recovery manager so both use the
//! same delay formula: `min(base * 2^(attempt-1), max)` with no jitter.

use crate::taxonomy::TypedError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Backoff strategy for retry operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `base * multiplier^(attempt-1)`, capped at `max`
    Exponential {
        #[serde(with = "humantime_serde")]
        base: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        BackoffStrategy::Exponential {
            base,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let factor = multiplier.powi(exponent);
                let delay_ms = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                std::cmp::min(Duration::from_millis(delay_ms as u64), *max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::exponential(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Configuration for retry operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-operation identifier for log lines
    pub operation_name: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            operation_name: None,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// Run `operation` until it succeeds, `should_retry` declines, or attempts run
/// out. The last failure is returned unchanged.
///
/// `operation` receives the 1-based attempt number. `should_retry` sees each
/// failure together with the attempt that produced it.
pub async fn retry<T, F, Fut, P>(
    config: &RetryConfig,
    mut should_retry: P,
    mut operation: F,
) -> Result<T, TypedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TypedError>>,
    P: FnMut(&TypedError, u32) -> bool,
{
    let name = config.operation_name.as_deref().unwrap_or("operation");
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", name, attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= max_attempts {
                    warn!(
                        code = %error.code(),
                        "{} failed after {} attempts: {}", name, attempt, error
                    );
                    return Err(error);
                }
                if !should_retry(&error, attempt) {
                    debug!(code = %error.code(), "{} failure is not retryable: {}", name, error);
                    return Err(error);
                }

                let delay = config.backoff.delay(attempt);
                warn!(
                    "Retry attempt {}/{} for {} after error: {} (waiting {:?})",
                    attempt, max_attempts, name, error, delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_delays_are_capped() {
        let backoff = BackoffStrategy::default();
        let delays: Vec<u64> = (1..=6).map(|a| backoff.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
        assert_eq!(backoff.delay(500), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_fixed_delay() {
        let backoff = BackoffStrategy::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();

        let result = retry(&RetryConfig::new(3), |_, _| true, |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TypedError::network("flaky"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_declined() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry(&RetryConfig::new(5), |e, _| e.is_retryable(), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TypedError::validation("bad input"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().message(), "bad input");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
