//! Tracing setup and span helpers
//!
//! Host applications that already install a subscriber only need
//! [`crate::console_tap::ConsoleTap`] as an extra layer. Everyone else can
//! call [`init_tracing`].

use crate::config::LoggingConfig;
use crate::console_tap::ConsoleTap;
use crate::error::{GuardrailError, GuardrailResult};
use std::time::Duration;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Directives used when `RUST_LOG` is unset
pub fn default_directives(level: &str) -> String {
    format!("{level},guardrail_core={level},hyper=warn,reqwest=warn,redb=warn")
}

/// Install the global subscriber: env filter, fmt output (pretty or json)
/// and, when given, the console tap.
pub fn init_tracing(config: &LoggingConfig, tap: Option<ConsoleTap>) -> GuardrailResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(&config.level))
            .map_err(|e| GuardrailError::configuration("logging.level", e.to_string()))?,
    };

    let fmt_layer = match config.format.as_str() {
        "json" => fmt::layer().json().with_target(true).with_current_span(true).boxed(),
        "pretty" => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .boxed(),
        other => {
            return Err(GuardrailError::configuration(
                "logging.format",
                format!("unknown format '{}', expected 'pretty' or 'json'", other),
            ))
        }
    };

    Registry::default()
        .with(fmt_layer)
        .with(tap)
        .with(env_filter)
        .try_init()
        .map_err(|e| GuardrailError::internal(format!("Failed to install tracing subscriber: {}", e)))
}

/// Span for one client call
#[inline]
pub fn request_span(kind: &str, operation: &str) -> Span {
    tracing::info_span!(
        "request",
        kind = %kind,
        operation = %operation,
    )
}

/// Span for one recovery attempt
#[inline]
pub fn recovery_span(strategy: &str, resource: &str) -> Span {
    tracing::info_span!(
        "recovery",
        strategy = %strategy,
        resource = %resource,
    )
}

/// Span for the background logging drain
#[inline]
pub fn drain_span(interval: Duration) -> Span {
    tracing::debug_span!("log_drain", interval_ms = interval.as_millis() as u64)
}
