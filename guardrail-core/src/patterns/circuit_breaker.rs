//! Circuit Breaker Pattern for Fault Tolerance
//!
//! The circuit breaker stops calling a dependency that appears persistently
//! failing, giving it time to heal instead of piling futile requests on it.
//!
//! ## States
//!
//! - **Closed**: calls pass through; consecutive failures are counted and a
//!   success resets the count. Reaching `failure_threshold` opens the circuit.
//! - **Open**: calls are rejected without invoking the operation until
//!   `reset_timeout` has elapsed; the next call then moves to half-open.
//! - **Half-Open**: successes are counted; `success_threshold` of them close
//!   the circuit. Any failure reopens it with a fresh reset timeout.
//!
//! Each guarded call also runs under its own hard `timeout`; exceeding it
//! counts as a failure.
//!
//! ## Usage Example
//!
//! ```rust
//! use std::time::Duration;
//! use guardrail_core::patterns::{CircuitBreakerBuilder, CircuitBreakerState};
//! use guardrail_core::taxonomy::TypedError;
//!
//! # async fn example() {
//! let breaker = CircuitBreakerBuilder::new("payments")
//!     .failure_threshold(3)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! let result = breaker
//!     .call(|| async { Ok::<_, TypedError>("charged") })
//!     .await;
//! assert!(result.is_ok());
//! assert_eq!(breaker.state(), CircuitBreakerState::Closed);
//! # }
//! ```

use crate::taxonomy::{classify, TypedError, UpstreamFailure};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Normal operation - requests pass through
    Closed,
    /// Failing fast - requests are rejected immediately
    Open,
    /// Testing if the dependency has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Hard timeout for each guarded call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Time spent open before a trial call is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_millis(30_000),
            reset_timeout: Duration::from_millis(60_000),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    next_attempt_time: Option<DateTime<Utc>>,
}

/// Named three-state circuit breaker
///
/// State transitions happen under a synchronous lock that is never held
/// across an await, so each transition is atomic with respect to other calls.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,

    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                next_attempt: None,
                next_attempt_time: None,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Execute an operation through the circuit breaker.
    ///
    /// While open, the operation is never invoked and a `ServiceUnavailable`
    /// error is returned. Failures of the operation are classified and
    /// returned with their classification intact.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, TypedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        if let Err(rejection) = self.try_acquire() {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(rejection);
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(e.into(), None)),
            Err(_) => Err(TypedError::timeout(format!(
                "Circuit breaker '{}' call timed out after {}ms",
                self.name,
                self.config.timeout.as_millis()
            ))),
        };

        match &result {
            Ok(_) => self.on_success(),
            Err(e) => self.on_failure(e),
        }

        result
    }

    /// Decide whether a call may proceed, moving Open -> HalfOpen once the
    /// reset timeout has elapsed.
    fn try_acquire(&self) -> Result<(), TypedError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => Ok(()),
            CircuitBreakerState::Open => {
                let ready = inner.next_attempt.map_or(true, |at| Instant::now() >= at);
                if ready {
                    inner.state = CircuitBreakerState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "Circuit breaker transitioning to half-open");
                    Ok(())
                } else {
                    let retry_after_ms = inner
                        .next_attempt
                        .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
                        .unwrap_or(0);
                    debug!(breaker = %self.name, retry_after_ms, "Circuit breaker rejected call");
                    let err = TypedError::service_unavailable(format!(
                        "Circuit breaker '{}' is open",
                        self.name
                    ));
                    let ctx = err
                        .context()
                        .clone()
                        .with_data("breaker", self.name.clone())
                        .with_data("retry_after_ms", retry_after_ms);
                    Err(err.with_context(ctx))
                }
            }
        }
    }

    fn on_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
            }
            CircuitBreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitBreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt = None;
                    inner.next_attempt_time = None;
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            // A call admitted before another call opened the circuit
            CircuitBreakerState::Open => {}
        }
    }

    fn on_failure(&self, error: &TypedError) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open_locked(&mut inner);
                    warn!(
                        breaker = %self.name,
                        code = %error.code(),
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                }
            }
            CircuitBreakerState::HalfOpen => {
                inner.failure_count += 1;
                self.open_locked(&mut inner);
                warn!(breaker = %self.name, "Circuit breaker reopening after failure in half-open state");
            }
            CircuitBreakerState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    fn open_locked(&self, inner: &mut BreakerInner) {
        inner.state = CircuitBreakerState::Open;
        inner.success_count = 0;
        inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        inner.next_attempt_time = chrono::Duration::from_std(self.config.reset_timeout)
            .ok()
            .map(|d| Utc::now() + d);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            next_attempt_time: inner.next_attempt_time,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit open (for emergencies and tests)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open_locked(&mut inner);
        warn!(breaker = %self.name, "Circuit breaker forcibly opened");
    }

    /// Force the circuit closed and clear its counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.next_attempt = None;
        inner.next_attempt_time = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }
}

/// Circuit breaker builder for easier configuration
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.name, self.config)
    }
}

/// Named breakers, created lazily and kept for the registry's lifetime
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    /// Return the breaker for `name`, creating it with the registry defaults.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, None)
    }

    /// `config` only applies when the breaker does not exist yet.
    pub fn get_or_create_with(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config.unwrap_or_else(|| self.defaults.clone())))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Force one breaker closed. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
