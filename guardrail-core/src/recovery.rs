//! Recovery manager
//!
//! Runs an operation that already failed once under a chosen strategy:
//! retry with backoff, fallback, compensating rollback or a named circuit
//! breaker. Every call to [`RecoveryManager::attempt_recovery`] appends one
//! [`RecoveryAttempt`] to a capped history that feeds [`RecoveryStats`].

use crate::observability::recovery_span;
use crate::patterns::{retry, BackoffStrategy, CircuitBreakerRegistry, RetryConfig};
use crate::taxonomy::{classify, ErrorCode, TypedError, UpstreamFailure};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    AutomaticRollback,
    CircuitBreaker,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::AutomaticRollback => "automatic_rollback",
            RecoveryStrategy::CircuitBreaker => "circuit_breaker",
        };
        f.write_str(s)
    }
}

/// Outcome of one recovery invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub original_error_message: String,
    pub original_error_code: ErrorCode,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub duration_ms: u64,
    /// Error log the recovered failure was recorded under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_id: Option<Uuid>,
    /// Final failure message when recovery did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
}

impl StrategyStats {
    fn add(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.success_rate = percentage(self.successful, self.total);
    }
}

/// Aggregate statistics over the retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage in `0.0..=100.0`
    pub success_rate: f64,
    pub by_strategy: HashMap<RecoveryStrategy, StrategyStats>,
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Receives every completed recovery attempt, e.g. for durable persistence
pub trait RecoveryReporter: Send + Sync {
    fn report(&self, attempt: &RecoveryAttempt, error: &TypedError);
}

type FallbackFn<'a, T> = Box<dyn FnOnce(TypedError) -> BoxFuture<'a, Result<T, TypedError>> + Send + 'a>;
type RollbackFn<'a> = Box<dyn FnOnce(TypedError) -> BoxFuture<'a, Result<(), TypedError>> + Send + 'a>;
type SuccessFn<'a> = Box<dyn FnOnce(&RecoveryAttempt) + Send + 'a>;
type FailureFn<'a> = Box<dyn FnOnce(&RecoveryAttempt, &TypedError) + Send + 'a>;

/// Strategy selection plus its hooks
pub struct RecoveryOptions<'a, T> {
    strategy: RecoveryStrategy,
    max_attempts: Option<u32>,
    error_log_id: Option<Uuid>,
    fallback: Option<FallbackFn<'a, T>>,
    rollback: Option<RollbackFn<'a>>,
    on_success: Option<SuccessFn<'a>>,
    on_failure: Option<FailureFn<'a>>,
}

impl<'a, T> RecoveryOptions<'a, T> {
    fn with_strategy(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            max_attempts: None,
            error_log_id: None,
            fallback: None,
            rollback: None,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn retry() -> Self {
        Self::with_strategy(RecoveryStrategy::Retry)
    }

    /// Run `fallback` with the classified failure if the operation fails.
    pub fn fallback<F, Fut>(fallback: F) -> Self
    where
        F: FnOnce(TypedError) -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, TypedError>> + Send + 'a,
    {
        let mut options = Self::with_strategy(RecoveryStrategy::Fallback);
        options.fallback = Some(Box::new(move |e| Box::pin(fallback(e))));
        options
    }

    /// Run `rollback` for compensation if the operation fails, then fail.
    pub fn rollback<F, Fut>(rollback: F) -> Self
    where
        F: FnOnce(TypedError) -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), TypedError>> + Send + 'a,
    {
        let mut options = Self::with_strategy(RecoveryStrategy::AutomaticRollback);
        options.rollback = Some(Box::new(move |e| Box::pin(rollback(e))));
        options
    }

    pub fn circuit_breaker() -> Self {
        Self::with_strategy(RecoveryStrategy::CircuitBreaker)
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Link the attempt to the error log returned by `EnhancedLogger::log_error`.
    pub fn error_log_id(mut self, id: Uuid) -> Self {
        self.error_log_id = Some(id);
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce(&RecoveryAttempt) + Send + 'a) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(&RecoveryAttempt, &TypedError) + Send + 'a) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.strategy
    }
}

pub struct RecoveryManager {
    breakers: Arc<CircuitBreakerRegistry>,
    backoff: BackoffStrategy,
    default_max_attempts: u32,
    history: Mutex<VecDeque<RecoveryAttempt>>,
    history_capacity: usize,
    reporter: RwLock<Option<Arc<dyn RecoveryReporter>>>,
}

impl RecoveryManager {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            breakers,
            backoff: BackoffStrategy::default(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            history: Mutex::new(VecDeque::new()),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            reporter: RwLock::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts.max(1);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn set_reporter(&self, reporter: Arc<dyn RecoveryReporter>) {
        *self.reporter.write() = Some(reporter);
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Recover from `error`, a failure previously produced by `operation`.
    ///
    /// Terminal failures are always returned to the caller; only the
    /// fallback strategy can turn a failure into a value.
    pub async fn attempt_recovery<T, E, F, Fut>(
        &self,
        mut operation: F,
        error: &TypedError,
        options: RecoveryOptions<'_, T>,
    ) -> Result<T, TypedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        let RecoveryOptions {
            strategy,
            max_attempts,
            error_log_id,
            fallback,
            rollback,
            on_success,
            on_failure,
        } = options;

        let resource = error.resource_name();
        let started = Instant::now();
        let span = recovery_span(&strategy.to_string(), &resource);

        let result = async {
            match strategy {
                RecoveryStrategy::Retry => {
                    let config = RetryConfig::new(max_attempts.unwrap_or(self.default_max_attempts))
                        .with_backoff(self.backoff)
                        .with_operation_name(format!("recovery of {}", resource));
                    retry(&config, |_, _| true, |_| {
                        let pending = operation();
                        async move { pending.await.map_err(|e| classify(e.into(), None)) }
                    })
                    .await
                }
                RecoveryStrategy::Fallback => match operation().await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        let failure = classify(e.into(), None);
                        match fallback {
                            Some(fallback) => {
                                info!(code = %failure.code(), "Operation failed, using fallback");
                                fallback(failure).await
                            }
                            None => {
                                warn!("Fallback strategy requested without a fallback function");
                                Err(failure)
                            }
                        }
                    }
                },
                RecoveryStrategy::AutomaticRollback => match operation().await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        let failure = classify(e.into(), None);
                        if let Some(rollback) = rollback {
                            if let Err(rollback_error) = rollback(failure.clone()).await {
                                error!(
                                    code = %rollback_error.code(),
                                    "Rollback failed: {}", rollback_error
                                );
                            } else {
                                info!("Rolled back after failure: {}", failure);
                            }
                        }
                        Err(failure)
                    }
                },
                RecoveryStrategy::CircuitBreaker => {
                    let breaker = self.breakers.get_or_create(&resource);
                    breaker.call(|| operation()).await
                }
            }
        }
        .instrument(span)
        .await;

        let attempt = RecoveryAttempt {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            original_error_message: error.message().to_string(),
            original_error_code: error.code(),
            strategy,
            success: result.is_ok(),
            duration_ms: started.elapsed().as_millis() as u64,
            error_log_id,
            error_message: result.as_ref().err().map(|e| e.message().to_string()),
        };
        self.record(attempt.clone(), error);

        match &result {
            Ok(_) => {
                info!(strategy = %strategy, resource = %resource, "Recovery succeeded");
                if let Some(callback) = on_success {
                    callback(&attempt);
                }
            }
            Err(final_error) => {
                warn!(
                    strategy = %strategy,
                    resource = %resource,
                    code = %final_error.code(),
                    "Recovery failed: {}", final_error
                );
                if let Some(callback) = on_failure {
                    callback(&attempt, final_error);
                }
            }
        }

        result
    }

    fn record(&self, attempt: RecoveryAttempt, error: &TypedError) {
        {
            let mut history = self.history.lock();
            history.push_back(attempt.clone());
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }

        let reporter = self.reporter.read().clone();
        if let Some(reporter) = reporter {
            reporter.report(&attempt, error);
        }
    }

    pub fn history(&self) -> Vec<RecoveryAttempt> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn get_recovery_stats(&self) -> RecoveryStats {
        let history = self.history.lock();
        let mut stats = RecoveryStats::default();
        for attempt in history.iter() {
            stats.total += 1;
            if attempt.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            stats.by_strategy.entry(attempt.strategy).or_default().add(attempt.success);
        }
        stats.success_rate = percentage(stats.successful, stats.total);
        stats
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{CircuitBreakerConfig, CircuitBreakerState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> RecoveryManager {
        RecoveryManager::new(Arc::new(CircuitBreakerRegistry::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_on_third_invocation() {
        let manager = manager();
        let calls = &AtomicU32::new(0);
        let original = TypedError::network("connection reset");

        let result = manager
            .attempt_recovery(
                || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TypedError::network("still down"))
                    } else {
                        Ok(7)
                    }
                },
                &original,
                RecoveryOptions::retry().max_attempts(3),
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].original_error_message, "connection reset");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_last_failure() {
        let manager = manager();
        let calls = &AtomicU32::new(0);

        let err = manager
            .attempt_recovery(
                || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TypedError::timeout(format!("attempt {}", n + 1)))
                },
                &TypedError::timeout("first"),
                RecoveryOptions::retry(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.message(), "attempt 3");
        assert_eq!(manager.get_recovery_stats().failed, 1);
    }

    #[tokio::test]
    async fn test_fallback_result_returned() {
        let manager = manager();
        let result = manager
            .attempt_recovery(
                || async { Err::<String, _>(TypedError::database("boom")) },
                &TypedError::database("boom"),
                RecoveryOptions::fallback(|_| async { Ok("cached".to_string()) }),
            )
            .await;
        assert_eq!(result.unwrap(), "cached");
    }

    #[tokio::test]
    async fn test_rollback_runs_then_fails() {
        let manager = manager();
        let rolled_back = &AtomicU32::new(0);
        let failures = &AtomicU32::new(0);

        let err = manager
            .attempt_recovery(
                || async { Err::<(), _>(UpstreamFailure::store("23505", "duplicate key")) },
                &TypedError::database("duplicate key"),
                RecoveryOptions::rollback(move |_| async move {
                    rolled_back.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_failure(move |_, _| {
                    failures.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Database);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_uses_integration_name() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        let manager = RecoveryManager::new(registry.clone());
        let original = TypedError::integration("stripe", "card declined");

        let _ = manager
            .attempt_recovery(
                || async { Err::<(), _>(TypedError::network("down")) },
                &original,
                RecoveryOptions::circuit_breaker(),
            )
            .await;

        let breaker = registry.get("stripe").expect("breaker created lazily");
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn test_stats_track_success_rate() {
        let manager = manager();
        let original = TypedError::network("x");

        let _ = manager
            .attempt_recovery(|| async { Ok::<_, TypedError>(1) }, &original, RecoveryOptions::circuit_breaker())
            .await;
        let _ = manager
            .attempt_recovery(
                || async { Err::<i32, _>(TypedError::network("x")) },
                &original,
                RecoveryOptions::fallback(|e| async move { Err(e) }),
            )
            .await;

        let stats = manager.get_recovery_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.by_strategy[&RecoveryStrategy::Fallback].failed, 1);
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let manager = manager().with_history_capacity(3);
        let original = TypedError::network("x");
        for _ in 0..5 {
            let _ = manager
                .attempt_recovery(|| async { Ok::<_, TypedError>(()) }, &original, RecoveryOptions::circuit_breaker())
                .await;
        }
        assert_eq!(manager.history().len(), 3);
    }
}
