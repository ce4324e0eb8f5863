//! Enhanced logger
//!
//! `log_error` never blocks: it fingerprints the error, takes the breadcrumb
//! trail and a snapshot while they still describe the moment of failure, and
//! queues the durable writes. A background drain (or an explicit `flush`)
//! persists queued work in FIFO order. Each write is independent and
//! best-effort: a failed breadcrumb insert does not stop the base record,
//! and nothing here ever fails the caller.

use crate::alerting::AlertDispatcher;
use crate::breadcrumbs::{Breadcrumb, BreadcrumbTracker};
use crate::config::LoggerConfig;
use crate::debugger::{Debugger, ErrorSnapshot};
use crate::error::GuardrailResult;
use crate::fingerprint::{ErrorFingerprint, FingerprintEngine, FingerprintStats};
use crate::observability::drain_span;
use crate::recovery::{RecoveryAttempt, RecoveryReporter};
use crate::store::{
    BreadcrumbRecord, ErrorLogQuery, ErrorLogRecord, FingerprintRecord, LogStore, RecoveryAttemptRecord,
    SnapshotRecord,
};
use crate::taxonomy::{ErrorCode, ErrorContext, Severity, TypedError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What to capture for one logged error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub fingerprint: bool,
    pub capture_breadcrumbs: bool,
    pub capture_snapshot: bool,
    /// Evaluate alert rules for critical errors
    pub alert: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            fingerprint: true,
            capture_breadcrumbs: true,
            capture_snapshot: true,
            alert: true,
        }
    }
}

impl From<&LoggerConfig> for LogOptions {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            fingerprint: config.enable_fingerprinting,
            capture_breadcrumbs: config.capture_breadcrumbs,
            capture_snapshot: config.capture_snapshot,
            alert: true,
        }
    }
}

struct QueuedError {
    log_id: Uuid,
    error: TypedError,
    context: ErrorContext,
    fingerprint: Option<ErrorFingerprint>,
    breadcrumbs: Vec<Breadcrumb>,
    snapshot: Option<ErrorSnapshot>,
    alert: bool,
}

enum QueueItem {
    Error(Box<QueuedError>),
    Recovery(RecoveryAttemptRecord),
}

/// Store-backed counters since a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub unresolved: usize,
    pub by_code: HashMap<ErrorCode, usize>,
    pub by_severity: HashMap<Severity, usize>,
}

pub struct EnhancedLogger {
    config: LoggerConfig,
    store: Arc<dyn LogStore>,
    fingerprints: Arc<FingerprintEngine>,
    tracker: Arc<BreadcrumbTracker>,
    debugger: Arc<Debugger>,
    alerts: Option<Arc<AlertDispatcher>>,
    queue: Mutex<VecDeque<QueueItem>>,
    drain_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EnhancedLogger {
    pub fn new(
        config: LoggerConfig,
        store: Arc<dyn LogStore>,
        fingerprints: Arc<FingerprintEngine>,
        tracker: Arc<BreadcrumbTracker>,
        debugger: Arc<Debugger>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            fingerprints,
            tracker,
            debugger,
            alerts: None,
            queue: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertDispatcher>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Record `error` and queue its persistence. Returns the id the base
    /// record will carry.
    pub fn log_error(&self, error: &TypedError, context: Option<ErrorContext>, options: Option<LogOptions>) -> Uuid {
        let options = options.unwrap_or_else(|| LogOptions::from(&self.config));
        let context = match context {
            Some(ctx) => ctx.merged_with(error.context()),
            None => error.context().clone(),
        };

        let fingerprint = if options.fingerprint {
            let signature = self.fingerprints.fingerprint(error, Some(&context));
            self.fingerprints.get(&signature)
        } else {
            None
        };
        let breadcrumbs = if options.capture_breadcrumbs {
            self.tracker.all()
        } else {
            Vec::new()
        };
        let snapshot = options
            .capture_snapshot
            .then(|| self.debugger.capture_snapshot(error, Some(&context)));
        self.tracker.error(error);

        let log_id = Uuid::new_v4();
        debug!(
            log_id = %log_id,
            code = %error.code(),
            fingerprint = ?fingerprint.as_ref().map(|f| f.id.as_str()),
            "Queued error for persistence"
        );
        self.queue.lock().push_back(QueueItem::Error(Box::new(QueuedError {
            log_id,
            error: error.clone(),
            context,
            fingerprint,
            breadcrumbs,
            snapshot,
            alert: options.alert,
        })));
        log_id
    }

    /// Queued items not yet persisted
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Persist everything queued so far. Returns the number of items drained.
    pub async fn flush(&self) -> usize {
        let _guard = self.drain_lock.lock().await;
        let mut drained = 0;

        loop {
            let next = self.queue.lock().pop_front();
            let Some(item) = next else {
                break;
            };
            match item {
                QueueItem::Error(queued) => self.persist_error(*queued).await,
                QueueItem::Recovery(record) => {
                    if let Err(e) = self.store.insert_recovery_attempt(&record).await {
                        warn!(error = %e, "Failed to persist recovery attempt");
                    }
                }
            }
            drained += 1;
        }

        if drained > 0 {
            debug!(drained, "Drained logging queue");
        }
        drained
    }

    async fn persist_error(&self, queued: QueuedError) {
        let QueuedError {
            log_id,
            error,
            context,
            fingerprint,
            breadcrumbs,
            snapshot,
            alert,
        } = queued;

        let record = ErrorLogRecord {
            id: log_id,
            code: error.code(),
            message: error.message().to_string(),
            user_message: error.user_message().to_string(),
            severity: error.severity(),
            user_id: context.user_id.clone(),
            tenant_id: context.tenant_id.clone(),
            url: context.origin_url.clone(),
            user_agent: context.user_agent.clone(),
            stack_trace: error.stack().map(str::to_string),
            fingerprint: fingerprint.as_ref().map(|f| f.id.clone()),
            context: serde_json::to_value(&context).unwrap_or_else(|_| json!({})),
            resolved: false,
            created_at: context.timestamp,
        };
        let log_id = match self.store.insert_error_log(&record).await {
            Ok(id) => id,
            Err(e) => {
                error!(log_id = %log_id, code = %error.code(), error = %e, "Failed to persist error log");
                log_id
            }
        };

        if let Some(fp) = &fingerprint {
            let record = FingerprintRecord {
                signature: fp.id.clone(),
                code: fp.error_code,
                normalized_message: fp.normalized_message.clone(),
                stack_hash: fp.stack_hash.clone(),
                component_path: fp.component_path.clone(),
                severity_score: fp.severity.weight(),
                occurrence_count: fp.occurrence_count,
                affected_user_count: fp.affected_users.len(),
                status: "active".to_string(),
                first_seen_at: fp.first_seen,
                last_seen_at: fp.last_seen,
            };
            if let Err(e) = self.store.upsert_fingerprint(&record).await {
                warn!(fingerprint = %fp.id, error = %e, "Failed to persist fingerprint");
            }
        }

        if !breadcrumbs.is_empty() {
            let records: Vec<BreadcrumbRecord> = breadcrumbs
                .iter()
                .map(|b| BreadcrumbRecord {
                    error_log_id: log_id,
                    category: b.category.to_string(),
                    level: b.level.to_string(),
                    message: b.message.clone(),
                    data: b.data.clone().unwrap_or_else(|| json!({})),
                    timestamp: b.timestamp,
                    sequence_number: b.sequence,
                })
                .collect();
            if let Err(e) = self.store.insert_breadcrumbs(&records).await {
                warn!(log_id = %log_id, error = %e, "Failed to persist breadcrumbs");
            }
        }

        if let Some(snapshot) = &snapshot {
            match serde_json::to_value(snapshot) {
                Ok(payload) => {
                    let record = SnapshotRecord {
                        error_log_id: log_id,
                        snapshot_id: snapshot.id,
                        payload,
                    };
                    if let Err(e) = self.store.insert_snapshot(&record).await {
                        warn!(snapshot_id = %snapshot.id, error = %e, "Failed to persist snapshot");
                    }
                }
                Err(e) => warn!(snapshot_id = %snapshot.id, error = %e, "Failed to encode snapshot"),
            }
        }

        if alert && error.severity() == Severity::Critical {
            if let Some(alerts) = &self.alerts {
                let fingerprint_id = fingerprint.as_ref().map(|f| f.id.as_str());
                alerts.evaluate(&error, fingerprint_id).await;
            }
        }
    }

    /// Start the periodic drain. Calling it twice keeps the first task.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let logger: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.drain_interval;

        *task = Some(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let Some(logger) = logger.upgrade() else {
                                break;
                            };
                            logger.flush().await;
                            logger.fingerprints.evict_stale();
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Logging drain stopped");
            }
            .instrument(drain_span(period)),
        ));
        info!(interval_ms = period.as_millis() as u64, "Logging drain started");
    }

    /// Stop the drain and persist whatever is still queued.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Logging drain task ended abnormally");
            }
        }
        self.flush().await;
    }

    pub fn top_errors(&self, n: usize) -> Vec<ErrorFingerprint> {
        self.fingerprints.most_frequent(n)
    }

    pub fn recent_errors(&self, minutes: i64) -> Vec<ErrorFingerprint> {
        self.fingerprints.recent(minutes)
    }

    pub fn errors_by_code(&self, code: ErrorCode) -> Vec<ErrorFingerprint> {
        self.fingerprints.by_code(code)
    }

    pub fn fingerprint_stats(&self) -> FingerprintStats {
        self.fingerprints.stats()
    }

    /// Counts from the durable store for errors logged at or after `since`.
    pub async fn error_stats(&self, since: DateTime<Utc>) -> GuardrailResult<ErrorStats> {
        let rows = self
            .store
            .query_error_logs(&ErrorLogQuery {
                since: Some(since),
                ..Default::default()
            })
            .await?;

        let mut stats = ErrorStats {
            total: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            *stats.by_code.entry(row.code).or_default() += 1;
            *stats.by_severity.entry(row.severity).or_default() += 1;
            if !row.resolved {
                stats.unresolved += 1;
            }
        }
        Ok(stats)
    }

    pub async fn mark_resolved(&self, log_id: Uuid) -> GuardrailResult<()> {
        self.store.mark_resolved(log_id).await
    }
}

impl RecoveryReporter for EnhancedLogger {
    fn report(&self, attempt: &RecoveryAttempt, error: &TypedError) {
        let record = RecoveryAttemptRecord {
            error_log_id: attempt.error_log_id,
            strategy: attempt.strategy.to_string(),
            success: attempt.success,
            duration_ms: attempt.duration_ms,
            error_message: attempt.error_message.clone(),
            metadata: json!({
                "attempt_id": attempt.id,
                "original_error_code": attempt.original_error_code,
                "original_error_message": attempt.original_error_message,
                "resource": error.resource_name(),
            }),
        };
        self.queue.lock().push_back(QueueItem::Recovery(record));
    }
}

impl Drop for EnhancedLogger {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebuggerConfig;
    use crate::console_tap::ConsoleRecorder;
    use crate::store::{InMemoryLogStore, ERROR_BREADCRUMBS};
    use crate::transport::NetworkRecorder;
    use std::time::Duration;

    fn logger(store: Arc<InMemoryLogStore>) -> EnhancedLogger {
        logger_with(store, LoggerConfig::default(), FingerprintEngine::default())
    }

    fn logger_with(
        store: Arc<InMemoryLogStore>,
        config: LoggerConfig,
        fingerprints: FingerprintEngine,
    ) -> EnhancedLogger {
        let tracker = Arc::new(BreadcrumbTracker::new(100));
        let debugger = Arc::new(Debugger::new(
            DebuggerConfig::default(),
            tracker.clone(),
            Arc::new(NetworkRecorder::new(20)),
            Arc::new(ConsoleRecorder::new(50)),
        ));
        EnhancedLogger::new(config, store, Arc::new(fingerprints), tracker, debugger)
    }

    #[tokio::test]
    async fn test_log_error_does_not_persist_until_drained() {
        let store = Arc::new(InMemoryLogStore::new());
        let logger = logger(store.clone());

        let id = logger.log_error(&TypedError::network("socket hang up"), None, None);
        assert_eq!(logger.pending(), 1);
        assert!(store.error_logs().is_empty());

        assert_eq!(logger.flush().await, 1);
        let logs = store.error_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, id);
        assert_eq!(store.fingerprints().len(), 1);
        assert_eq!(store.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_breadcrumb_failure_does_not_block_base_record() {
        let store = Arc::new(InMemoryLogStore::new());
        store.fail_table(ERROR_BREADCRUMBS);
        let logger = logger(store.clone());
        logger.tracker.navigation("/", "/settings");

        logger.log_error(&TypedError::permission("denied"), None, None);
        logger.flush().await;

        assert_eq!(store.error_logs().len(), 1);
        assert!(store.breadcrumbs().is_empty());
        assert_eq!(store.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_is_fifo() {
        let store = Arc::new(InMemoryLogStore::new());
        let logger = logger(store.clone());
        let ids: Vec<Uuid> = (0..3)
            .map(|i| {
                logger.log_error(
                    &TypedError::validation(format!("field {}", i)),
                    None,
                    Some(LogOptions {
                        capture_snapshot: false,
                        ..Default::default()
                    }),
                )
            })
            .collect();
        logger.flush().await;

        let stored: Vec<Uuid> = store.error_logs().iter().map(|r| r.id).collect();
        assert_eq!(stored, ids);
    }

    #[tokio::test]
    async fn test_repeats_collapse_into_one_fingerprint() {
        let store = Arc::new(InMemoryLogStore::new());
        let logger = logger(store.clone());
        for id in [17, 42, 99] {
            let ctx = ErrorContext::new().with_user(format!("user-{}", id));
            logger.log_error(&TypedError::not_found(format!("Invoice {} not found", id)), Some(ctx), None);
        }
        logger.flush().await;

        let fingerprints = store.fingerprints();
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(fingerprints[0].occurrence_count, 3);
        assert_eq!(fingerprints[0].affected_user_count, 3);
        assert_eq!(logger.top_errors(1)[0].occurrence_count, 3);
    }

    #[tokio::test]
    async fn test_error_stats_from_store() {
        let store = Arc::new(InMemoryLogStore::new());
        let logger = logger(store.clone());
        let since = Utc::now() - chrono::Duration::minutes(1);
        logger.log_error(&TypedError::network("a"), None, None);
        let resolved = logger.log_error(&TypedError::network("b"), None, None);
        logger.log_error(&TypedError::auth("c"), None, None);
        logger.flush().await;
        logger.mark_resolved(resolved).await.unwrap();

        let stats = logger.error_stats(since).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.by_code[&ErrorCode::Network], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_drain_and_shutdown() {
        let store = Arc::new(InMemoryLogStore::new());
        let logger = Arc::new(logger(store.clone()));
        logger.start();

        logger.log_error(&TypedError::timeout("slow"), None, None);
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(store.error_logs().len(), 1);

        logger.log_error(&TypedError::timeout("slow again"), None, None);
        logger.shutdown().await;
        assert_eq!(store.error_logs().len(), 2);
        assert_eq!(logger.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_tick_evicts_stale_fingerprints() {
        let store = Arc::new(InMemoryLogStore::new());
        let config = LoggerConfig {
            drain_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let logger = Arc::new(logger_with(
            store.clone(),
            config,
            FingerprintEngine::new(Duration::from_millis(10)),
        ));

        logger.log_error(&TypedError::network("socket hang up"), None, None);
        assert_eq!(logger.fingerprints.len(), 1);

        logger.start();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !logger.fingerprints.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(logger.fingerprints.is_empty());
        assert!(logger.top_errors(5).is_empty());
        assert_eq!(store.error_logs().len(), 1);
        logger.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_attempt_links_to_error_log() {
        use crate::patterns::{CircuitBreakerConfig, CircuitBreakerRegistry};
        use crate::recovery::{RecoveryManager, RecoveryOptions};

        let store = Arc::new(InMemoryLogStore::new());
        let logger = Arc::new(logger(store.clone()));
        let recovery = RecoveryManager::new(Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())));
        recovery.set_reporter(logger.clone());

        let failure = TypedError::network("socket hang up");
        let log_id = logger.log_error(&failure, None, None);
        let value = recovery
            .attempt_recovery(
                || async { Ok::<_, TypedError>(5) },
                &failure,
                RecoveryOptions::retry().error_log_id(log_id),
            )
            .await
            .unwrap();
        assert_eq!(value, 5);
        recovery
            .attempt_recovery(|| async { Ok::<_, TypedError>(6) }, &failure, RecoveryOptions::retry())
            .await
            .unwrap();
        logger.flush().await;

        let attempts = store.recovery_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error_log_id, Some(log_id));
        assert_eq!(attempts[0].strategy, "retry");
        assert_eq!(attempts[1].error_log_id, None);
        assert_eq!(store.error_logs()[0].id, log_id);
    }
}
