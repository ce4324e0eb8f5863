//! Resilient request client
//!
//! The primary call wrapper for the remote service. Each attempt runs under
//! a timeout; failures are classified, retried with backoff when their code
//! is in the retryable set, and the final failure is logged (unless
//! suppressed) and returned as a [`TypedError`].
//!
//! Timed-out attempts are dropped at their next suspension point. Work the
//! remote side already accepted may still complete.

use crate::breadcrumbs::BreadcrumbTracker;
use crate::config::{ClientConfig, RetrySettings};
use crate::logger::EnhancedLogger;
use crate::observability::request_span;
use crate::patterns::retry;
use crate::taxonomy::{classify, ErrorCode, ErrorContext, TypedError, UpstreamFailure};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Invoke,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Query => "QUERY",
            OperationKind::Mutation => "MUTATE",
            OperationKind::Invoke => "INVOKE",
        };
        f.write_str(s)
    }
}

/// Cooperative cancellation flag, checked before each attempt
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Per-call overrides of the client defaults
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    pub timeout: Option<Duration>,
    pub retry: Option<RetrySettings>,
    pub retryable_codes: Option<Vec<ErrorCode>>,
    pub suppress_logging: bool,
    pub operation_name: Option<String>,
    pub context: Option<ErrorContext>,
    pub abort: Option<AbortSignal>,
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Shorthand for a retry budget with the default delays
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        let mut retry = self.retry.take().unwrap_or_default();
        retry.max_retries = max_retries;
        self.retry = Some(retry);
        self
    }

    pub fn retryable_codes(mut self, codes: Vec<ErrorCode>) -> Self {
        self.retryable_codes = Some(codes);
        self
    }

    pub fn suppress_logging(mut self) -> Self {
        self.suppress_logging = true;
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, TypedError>>>;

pub struct ResilientClient {
    config: ClientConfig,
    tracker: Arc<BreadcrumbTracker>,
    logger: Option<Arc<EnhancedLogger>>,
    in_flight: DashMap<String, Arc<dyn Any + Send + Sync>>,
    status: watch::Sender<NetworkStatus>,
}

impl ResilientClient {
    pub fn new(config: ClientConfig, tracker: Arc<BreadcrumbTracker>) -> Self {
        let (status, _) = watch::channel(NetworkStatus::Online);
        Self {
            config,
            tracker,
            logger: None,
            in_flight: DashMap::new(),
            status,
        }
    }

    pub fn with_logger(mut self, logger: Arc<EnhancedLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Observe connectivity as seen by the client
    pub fn network_status(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Report connectivity from the host (e.g. an OS reachability probe)
    pub fn set_network_status(&self, status: NetworkStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(status = ?status, "Network status changed");
        }
    }

    pub async fn query<T, E, F, Fut>(&self, operation: F, config: Option<RequestConfig>) -> Result<T, TypedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        self.execute(OperationKind::Query, operation, config.unwrap_or_default())
            .await
    }

    pub async fn mutate<T, E, F, Fut>(&self, operation: F, config: Option<RequestConfig>) -> Result<T, TypedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        self.execute(OperationKind::Mutation, operation, config.unwrap_or_default())
            .await
    }

    pub async fn invoke<T, E, F, Fut>(&self, operation: F, config: Option<RequestConfig>) -> Result<T, TypedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        self.execute(OperationKind::Invoke, operation, config.unwrap_or_default())
            .await
    }

    async fn execute<T, E, F, Fut>(&self, kind: OperationKind, mut operation: F, config: RequestConfig) -> Result<T, TypedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        let name = config
            .operation_name
            .clone()
            .unwrap_or_else(|| kind.to_string().to_lowercase());
        let timeout = config.timeout.unwrap_or(self.config.timeout);
        let retry_config = config
            .retry
            .as_ref()
            .unwrap_or(&self.config.retry)
            .to_retry_config()
            .with_operation_name(name.clone());
        let retryable = config
            .retryable_codes
            .clone()
            .unwrap_or_else(|| self.config.retryable_codes.clone());
        let context = config.context.clone().unwrap_or_default();
        let abort = config.abort.clone();

        let started = Instant::now();
        let span = request_span(&kind.to_string(), &name);

        let result = retry(
            &retry_config,
            |error, _| {
                let aborted = abort.as_ref().map_or(false, AbortSignal::is_aborted);
                !aborted && retryable.contains(&error.code())
            },
            |attempt| {
                let pending = operation();
                let abort = abort.clone();
                let context = context.clone();
                let name = name.as_str();
                async move {
                    if abort.as_ref().map_or(false, AbortSignal::is_aborted) {
                        return Err(TypedError::cancelled(format!("{} aborted before attempt {}", name, attempt))
                            .with_context(context));
                    }
                    match tokio::time::timeout(timeout, pending).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(classify(e.into(), Some(context))),
                        Err(_) => Err(TypedError::timeout(format!(
                            "{} timed out after {}ms",
                            name,
                            timeout.as_millis()
                        ))
                        .with_context(context)),
                    }
                }
            },
        )
        .instrument(span)
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.set_network_status(NetworkStatus::Online);
                self.tracker.api_call(&kind.to_string(), &name, 200, duration_ms);
                debug!(operation = %name, duration_ms, "Request completed");
            }
            Err(error) => {
                if error.code() == ErrorCode::Network {
                    self.set_network_status(NetworkStatus::Offline);
                }
                self.tracker
                    .api_call(&kind.to_string(), &name, error.http_status(), duration_ms);
                warn!(operation = %name, code = %error.code(), duration_ms, "Request failed: {}", error);

                if !config.suppress_logging {
                    if let Some(logger) = &self.logger {
                        logger.log_error(error, Some(context.clone()), None);
                    }
                }
            }
        }

        result
    }

    /// Collapse concurrent calls sharing `key` into one in-flight operation.
    ///
    /// The first caller's `operation` runs; later callers with the same key
    /// await its result. The key is released once that result is ready.
    pub async fn deduplicate<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, TypedError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TypedError>> + Send + 'static,
    {
        let shared: SharedResult<T> = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                drop(entry);
                match existing.downcast::<SharedResult<T>>() {
                    Ok(existing) => {
                        debug!(key, "Joining in-flight request");
                        (*existing).clone()
                    }
                    Err(_) => {
                        warn!(key, "Deduplication key reused with a different result type");
                        return Err(TypedError::internal(format!(
                            "deduplication key '{}' is in flight with a different result type",
                            key
                        )));
                    }
                }
            }
            Entry::Vacant(entry) => {
                let fresh = operation().boxed().shared();
                entry.insert(Arc::new(fresh.clone()));
                fresh
            }
        };

        let result = shared.clone().await;
        self.in_flight.remove_if(key, |_, current| {
            current
                .downcast_ref::<SharedResult<T>>()
                .map_or(false, |current| current.ptr_eq(&shared))
        });
        result
    }

    /// Number of deduplication keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `operations` at most `concurrency` at a time. Results come back in
    /// input order, one per operation; a failure does not stop the others.
    pub async fn batch<T, E, F, Fut>(&self, operations: Vec<F>, concurrency: Option<usize>) -> Vec<Result<T, TypedError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<UpstreamFailure>,
    {
        let window = concurrency.unwrap_or(self.config.batch_concurrency).max(1);
        let timeout = self.config.timeout;

        stream::iter(operations.into_iter().map(|operation| async move {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(classify(e.into(), None)),
                Err(_) => Err(TypedError::timeout(format!(
                    "batch operation timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        }))
        .buffered(window)
        .collect()
        .await
    }
}
