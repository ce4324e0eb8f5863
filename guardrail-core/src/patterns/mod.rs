//! Resilience patterns shared across the crate
//!
//! The circuit breaker guards named resources; the retry helper drives both
//! the request client and the recovery manager's retry strategy.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitBreakerStats,
};
pub use retry::{retry, BackoffStrategy, RetryConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
