//! Guardrail: client-side resilience and error observability
//!
//! Wraps calls to a remote backend with retry, timeout, deduplication and
//! circuit breaking, classifies every failure into one taxonomy, and ships
//! enriched error telemetry (fingerprints, breadcrumbs, snapshots, recovery
//! attempts) to a durable store without ever failing the caller.
//!
//! Start from [`Guardrail::builder`] to get every component wired from one
//! [`GuardrailConfig`], or construct the pieces individually.

pub mod alerting;
pub mod breadcrumbs;
pub mod client;
pub mod config;
pub mod console_tap;
pub mod debugger;
pub mod error;
pub mod fingerprint;
pub mod guardrail;
pub mod local_cache;
pub mod logger;
pub mod observability;
pub mod patterns;
pub mod recovery;
pub mod store;
pub mod taxonomy;
pub mod transport;

pub use breadcrumbs::{Breadcrumb, BreadcrumbCategory, BreadcrumbLevel, BreadcrumbTracker};
pub use client::{AbortSignal, NetworkStatus, RequestConfig, ResilientClient};
pub use config::GuardrailConfig;
pub use debugger::{Debugger, ErrorSnapshot};
pub use error::{GuardrailError, GuardrailResult};
pub use fingerprint::{ErrorFingerprint, FingerprintEngine};
pub use guardrail::{Guardrail, GuardrailBuilder};
pub use logger::{EnhancedLogger, LogOptions};
pub use patterns::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState};
pub use recovery::{RecoveryManager, RecoveryOptions, RecoveryStrategy};
pub use taxonomy::{classify, ErrorCode, ErrorContext, Severity, TypedError, UpstreamFailure};
