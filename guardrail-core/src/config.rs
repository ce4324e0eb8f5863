//! Configuration with TOML support and environment overrides
//!
//! Every section carries `#[serde(default)]`, so a partial file (or none at
//! all) yields the documented defaults. Values given per call on the request
//! client take precedence over what is configured here.

use crate::alerting::AlertRule;
use crate::error::{GuardrailError, GuardrailResult};
use crate::patterns::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use crate::taxonomy::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub client: ClientConfig,
    pub breaker: CircuitBreakerConfig,
    pub recovery: RecoveryConfig,
    pub breadcrumbs: BreadcrumbConfig,
    pub debugger: DebuggerConfig,
    pub fingerprints: FingerprintConfig,
    pub logger: LoggerConfig,
    pub alerts: AlertsConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Request client defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry: RetrySettings,
    /// Codes eligible for retry
    pub retryable_codes: Vec<ErrorCode>,
    /// Default window for `batch`
    pub batch_concurrency: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            retry: RetrySettings::default(),
            retryable_codes: vec![ErrorCode::Network, ErrorCode::Timeout, ErrorCode::RateLimit],
            batch_concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub exponential: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            exponential: true,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> BackoffStrategy {
        if self.exponential {
            BackoffStrategy::exponential(self.base_delay, self.max_delay)
        } else {
            BackoffStrategy::Fixed {
                delay: self.base_delay,
            }
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries.saturating_add(1)).with_backoff(self.backoff())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub history_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreadcrumbConfig {
    pub capacity: usize,
    /// Latest entries kept in the local cache
    pub persist_count: usize,
}

impl Default for BreadcrumbConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            persist_count: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub snapshot_capacity: usize,
    pub persist_count: usize,
    /// Breadcrumbs bundled into a snapshot
    pub breadcrumb_limit: usize,
    pub network_capacity: usize,
    pub console_capacity: usize,
    /// Request/response bodies are truncated to this many characters
    pub body_limit: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: 50,
            persist_count: 10,
            breadcrumb_limit: 50,
            network_capacity: 20,
            console_capacity: 50,
            body_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    #[serde(with = "humantime_serde")]
    pub drain_interval: Duration,
    pub enable_fingerprinting: bool,
    pub capture_breadcrumbs: bool,
    pub capture_snapshot: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(1),
            enable_fingerprinting: true,
            capture_breadcrumbs: true,
            capture_snapshot: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub rules: Vec<AlertRule>,
}

/// Remote log store endpoint; without a URL records stay in memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Rows kept per table by the in-memory store
    pub memory_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout: Duration::from_secs(10),
            memory_capacity: crate::store::DEFAULT_MEMORY_CAPACITY,
        }
    }
}

/// Local durable cache; without a path the cache lives in memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// Turn application log events into console breadcrumbs
    pub console_tap: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            console_tap: true,
        }
    }
}

impl GuardrailConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> GuardrailResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            GuardrailError::configuration("file", format!("Failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> GuardrailResult<Self> {
        toml::from_str(contents)
            .map_err(|e| GuardrailError::configuration("toml", format!("Failed to parse TOML: {}", e)))
    }

    /// Apply `GUARDRAIL_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("GUARDRAIL_STORE_URL") {
            self.store.url = Some(url);
        }
        if let Ok(key) = std::env::var("GUARDRAIL_STORE_API_KEY") {
            self.store.api_key = Some(key);
        }
        if let Ok(path) = std::env::var("GUARDRAIL_CACHE_PATH") {
            self.cache.path = Some(PathBuf::from(path));
        }
        if let Ok(level) = std::env::var("GUARDRAIL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(ms) = std::env::var("GUARDRAIL_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.client.timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(ms) = std::env::var("GUARDRAIL_DRAIN_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                self.logger.drain_interval = Duration::from_millis(ms);
            }
        }
    }

    pub fn validate(&self) -> GuardrailResult<()> {
        if self.client.timeout.is_zero() {
            return Err(GuardrailError::configuration("client", "Timeout must be greater than zero"));
        }
        if self.client.batch_concurrency == 0 {
            return Err(GuardrailError::configuration("client", "Batch concurrency must be at least 1"));
        }
        if self.client.retry.base_delay > self.client.retry.max_delay {
            return Err(GuardrailError::configuration(
                "client",
                "Retry base delay cannot exceed max delay",
            ));
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(GuardrailError::configuration("breaker", "Thresholds must be at least 1"));
        }
        if self.breaker.timeout.is_zero() {
            return Err(GuardrailError::configuration("breaker", "Call timeout must be greater than zero"));
        }

        if self.breadcrumbs.capacity == 0 {
            return Err(GuardrailError::configuration("breadcrumbs", "Capacity must be at least 1"));
        }
        if self.breadcrumbs.persist_count > self.breadcrumbs.capacity {
            return Err(GuardrailError::configuration(
                "breadcrumbs",
                "Persist count cannot exceed capacity",
            ));
        }
        if self.debugger.snapshot_capacity == 0 {
            return Err(GuardrailError::configuration("debugger", "Snapshot capacity must be at least 1"));
        }
        if self.debugger.persist_count > self.debugger.snapshot_capacity {
            return Err(GuardrailError::configuration(
                "debugger",
                "Persist count cannot exceed snapshot capacity",
            ));
        }
        if self.recovery.history_capacity == 0 {
            return Err(GuardrailError::configuration("recovery", "History capacity must be at least 1"));
        }
        if self.logger.drain_interval.is_zero() {
            return Err(GuardrailError::configuration("logger", "Drain interval must be greater than zero"));
        }

        if self.store.memory_capacity == 0 {
            return Err(GuardrailError::configuration("store", "Memory capacity must be at least 1"));
        }
        if let Some(raw) = &self.store.url {
            url::Url::parse(raw)
                .map_err(|e| GuardrailError::configuration("store", format!("Invalid store URL '{}': {}", raw, e)))?;
        }

        for rule in &self.alerts.rules {
            if rule.channels.is_empty() {
                return Err(GuardrailError::configuration(
                    "alerts",
                    format!("Alert rule '{}' has no channels", rule.name),
                ));
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(GuardrailError::configuration(
                    "logging",
                    format!("Invalid log level: {}", other),
                ))
            }
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(GuardrailError::configuration(
                    "logging",
                    format!("Invalid log format: {}", other),
                ))
            }
        }

        Ok(())
    }
}
