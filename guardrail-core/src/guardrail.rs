//! Top-level handle wiring every component from one configuration
//!
//! ```no_run
//! use guardrail_core::{Guardrail, GuardrailConfig};
//!
//! # async fn run() -> guardrail_core::GuardrailResult<()> {
//! let guardrail = Guardrail::builder(GuardrailConfig::default()).build()?;
//! guardrail.start();
//!
//! let invoices = guardrail
//!     .client()
//!     .query(|| async { Ok::<_, guardrail_core::UpstreamFailure>(vec!["inv-1"]) }, None)
//!     .await;
//! assert!(invoices.is_ok());
//!
//! guardrail.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::alerting::{AlertDispatcher, AlertTransport, HttpAlertTransport};
use crate::breadcrumbs::BreadcrumbTracker;
use crate::client::ResilientClient;
use crate::config::GuardrailConfig;
use crate::console_tap::{ConsoleRecorder, ConsoleTap};
use crate::debugger::Debugger;
use crate::error::GuardrailResult;
use crate::fingerprint::FingerprintEngine;
use crate::local_cache::{LocalCache, MemoryCache, RedbCache};
use crate::logger::EnhancedLogger;
use crate::observability;
use crate::patterns::CircuitBreakerRegistry;
use crate::recovery::RecoveryManager;
use crate::store::{HttpLogStore, InMemoryLogStore, LogStore};
use crate::transport::{BreadcrumbInterceptor, InstrumentedTransport, NetworkRecorder};
use std::sync::Arc;
use tracing::{info, warn};

pub struct GuardrailBuilder {
    config: GuardrailConfig,
    http: Option<reqwest::Client>,
    store: Option<Arc<dyn LogStore>>,
    cache: Option<Arc<dyn LocalCache>>,
    alert_transport: Option<Arc<dyn AlertTransport>>,
}

impl GuardrailBuilder {
    /// Share an existing HTTP client
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Replace the store selected by `store.url`
    pub fn log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the cache selected by `cache.path`
    pub fn local_cache(mut self, cache: Arc<dyn LocalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn alert_transport(mut self, transport: Arc<dyn AlertTransport>) -> Self {
        self.alert_transport = Some(transport);
        self
    }

    pub fn build(self) -> GuardrailResult<Guardrail> {
        let config = self.config;
        config.validate()?;
        let http = self.http.unwrap_or_default();

        let cache: Arc<dyn LocalCache> = match (self.cache, &config.cache.path) {
            (Some(cache), _) => cache,
            (None, Some(path)) => Arc::new(RedbCache::open(path)?),
            (None, None) => Arc::new(MemoryCache::new()),
        };
        let store: Arc<dyn LogStore> = match (self.store, &config.store.url) {
            (Some(store), _) => store,
            (None, Some(url)) => Arc::new(
                HttpLogStore::new(http.clone(), url, config.store.api_key.clone())?
                    .with_timeout(config.store.timeout),
            ),
            (None, None) => {
                warn!(
                    capacity = config.store.memory_capacity,
                    "No remote store configured; keeping recent error logs in memory only"
                );
                Arc::new(InMemoryLogStore::with_capacity(config.store.memory_capacity))
            }
        };

        let tracker = Arc::new(
            BreadcrumbTracker::new(config.breadcrumbs.capacity)
                .with_cache(cache.clone(), config.breadcrumbs.persist_count),
        );
        let fingerprints = Arc::new(FingerprintEngine::new(config.fingerprints.stale_after));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));

        let network = Arc::new(NetworkRecorder::new(config.debugger.network_capacity));
        let console = Arc::new(ConsoleRecorder::new(config.debugger.console_capacity));
        let transport = Arc::new(InstrumentedTransport::new(http.clone()).with_body_limit(config.debugger.body_limit));
        transport.add_interceptor(network.clone());
        transport.add_interceptor(Arc::new(BreadcrumbInterceptor::new(tracker.clone())));

        let client = ResilientClient::new(config.client.clone(), tracker.clone());
        let debugger = Arc::new(
            Debugger::new(config.debugger.clone(), tracker.clone(), network, console)
                .with_cache(cache.clone())
                .with_network_status(client.network_status()),
        );

        let alerts = if config.alerts.enabled {
            let transport = self.alert_transport.unwrap_or_else(|| {
                Arc::new(HttpAlertTransport::new(
                    http.clone(),
                    config.store.url.clone(),
                    config.store.api_key.clone(),
                ))
            });
            Some(Arc::new(AlertDispatcher::new(config.alerts.rules.clone(), transport)))
        } else {
            None
        };

        let mut logger = EnhancedLogger::new(
            config.logger.clone(),
            store,
            fingerprints,
            tracker.clone(),
            debugger.clone(),
        );
        if let Some(alerts) = &alerts {
            logger = logger.with_alerts(alerts.clone());
        }
        let logger = Arc::new(logger);

        let recovery = Arc::new(
            RecoveryManager::new(breakers.clone())
                .with_backoff(config.client.retry.backoff())
                .with_default_max_attempts(config.recovery.max_attempts)
                .with_history_capacity(config.recovery.history_capacity),
        );
        recovery.set_reporter(logger.clone());

        let client = Arc::new(client.with_logger(logger.clone()));

        info!(
            remote_store = config.store.url.is_some(),
            durable_cache = config.cache.path.is_some(),
            alerts = alerts.is_some(),
            "Guardrail initialized"
        );

        Ok(Guardrail {
            config,
            tracker,
            breakers,
            recovery,
            debugger,
            transport,
            logger,
            client,
        })
    }
}

/// Shared handle; clone the inner `Arc`s to hand components out
pub struct Guardrail {
    config: GuardrailConfig,
    tracker: Arc<BreadcrumbTracker>,
    breakers: Arc<CircuitBreakerRegistry>,
    recovery: Arc<RecoveryManager>,
    debugger: Arc<Debugger>,
    transport: Arc<InstrumentedTransport>,
    logger: Arc<EnhancedLogger>,
    client: Arc<ResilientClient>,
}

impl Guardrail {
    pub fn builder(config: GuardrailConfig) -> GuardrailBuilder {
        GuardrailBuilder {
            config,
            http: None,
            store: None,
            cache: None,
            alert_transport: None,
        }
    }

    /// Start background work. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        self.logger.start();
    }

    /// Stop background work and flush queued telemetry.
    pub async fn shutdown(&self) {
        self.logger.shutdown().await;
        info!("Guardrail shut down");
    }

    /// Layer that feeds application log events into breadcrumbs
    pub fn console_tap(&self) -> ConsoleTap {
        ConsoleTap::new(self.tracker.clone(), self.debugger.console().clone())
    }

    /// Install a global subscriber per the `logging` section
    pub fn init_tracing(&self) -> GuardrailResult<()> {
        let tap = self.config.logging.console_tap.then(|| self.console_tap());
        observability::init_tracing(&self.config.logging, tap)
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    pub fn breadcrumbs(&self) -> &Arc<BreadcrumbTracker> {
        &self.tracker
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn debugger(&self) -> &Arc<Debugger> {
        &self.debugger
    }

    pub fn transport(&self) -> &Arc<InstrumentedTransport> {
        &self.transport
    }

    pub fn logger(&self) -> &Arc<EnhancedLogger> {
        &self.logger
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RequestConfig;
    use crate::recovery::RecoveryOptions;
    use crate::taxonomy::{TypedError, UpstreamFailure};

    fn guardrail(store: Arc<InMemoryLogStore>) -> Guardrail {
        Guardrail::builder(GuardrailConfig::default())
            .log_store(store)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_query_reaches_store() {
        let store = Arc::new(InMemoryLogStore::new());
        let guardrail = guardrail(store.clone());

        let result = guardrail
            .client()
            .query(
                || async { Err::<(), _>(UpstreamFailure::http(403, "forbidden")) },
                Some(RequestConfig::new().operation_name("load settings")),
            )
            .await;
        assert!(result.is_err());

        guardrail.logger().flush().await;
        let logs = store.error_logs();
        assert_eq!(logs.len(), 1);
        assert!(!store.breadcrumbs().is_empty());
        assert_eq!(guardrail.debugger().snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_attempts_are_reported() {
        let store = Arc::new(InMemoryLogStore::new());
        let guardrail = guardrail(store.clone());

        let value = guardrail
            .recovery()
            .attempt_recovery(
                || async { Err::<u32, _>(UpstreamFailure::other("still broken")) },
                &TypedError::database("write failed"),
                RecoveryOptions::fallback(|_| async { Ok(7) }),
            )
            .await
            .unwrap();
        assert_eq!(value, 7);

        guardrail.logger().flush().await;
        let attempts = store.recovery_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].strategy, "fallback");
        assert!(attempts[0].success);
    }
}
