//! Instrumented HTTP transport
//!
//! All outbound calls that should show up in diagnostics go through one
//! shared [`InstrumentedTransport`]. Each completed exchange is reported to
//! the registered [`TransportInterceptor`]s: the [`NetworkRecorder`] keeps
//! the latest calls for snapshots and the [`BreadcrumbInterceptor`] turns
//! each call into an `api_call` breadcrumb.

use crate::breadcrumbs::{BreadcrumbCategory, BreadcrumbLevel, BreadcrumbTracker};
use crate::taxonomy::UpstreamFailure;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_NETWORK_CAPACITY: usize = 20;
pub const DEFAULT_BODY_LIMIT: usize = 1000;

/// One intercepted request/response exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    /// `None` when no response arrived
    pub status: Option<u16>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkRecord {
    pub fn is_failure(&self) -> bool {
        self.status.map_or(true, |s| s >= 400)
    }
}

pub trait TransportInterceptor: Send + Sync {
    fn on_complete(&self, record: &NetworkRecord);
}

/// Ring of the most recent exchanges
pub struct NetworkRecorder {
    entries: Mutex<VecDeque<NetworkRecord>>,
    capacity: usize,
}

impl Default for NetworkRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORK_CAPACITY)
    }
}

impl NetworkRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: NetworkRecord) {
        let mut entries = self.entries.lock();
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Oldest first
    pub fn recent(&self, n: usize) -> Vec<NetworkRecord> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl TransportInterceptor for NetworkRecorder {
    fn on_complete(&self, record: &NetworkRecord) {
        self.record(record.clone());
    }
}

pub struct BreadcrumbInterceptor {
    tracker: Arc<BreadcrumbTracker>,
}

impl BreadcrumbInterceptor {
    pub fn new(tracker: Arc<BreadcrumbTracker>) -> Self {
        Self { tracker }
    }
}

impl TransportInterceptor for BreadcrumbInterceptor {
    fn on_complete(&self, record: &NetworkRecord) {
        match record.status {
            Some(status) => {
                self.tracker
                    .api_call(&record.method, &record.url, status, record.duration_ms);
            }
            None => {
                self.tracker.record(
                    BreadcrumbCategory::ApiCall,
                    BreadcrumbLevel::Error,
                    format!("{} {} failed", record.method, record.url),
                    Some(json!({
                        "method": record.method,
                        "url": record.url,
                        "duration_ms": record.duration_ms,
                        "error": record.error,
                    })),
                );
            }
        }
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UpstreamFailure> {
        serde_json::from_slice(&self.body).map_err(|e| UpstreamFailure::Validation {
            field: None,
            message: format!("Invalid response body: {}", e),
        })
    }

    /// Turn a non-success status into an upstream failure
    pub fn error_for_status(self) -> Result<Self, UpstreamFailure> {
        if self.status.is_success() {
            return Ok(self);
        }
        let body = self.text();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                ["message", "error", "msg"]
                    .iter()
                    .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
            })
            .unwrap_or_else(|| {
                self.status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        Err(UpstreamFailure::Http {
            status: self.status.as_u16(),
            message,
            body: if body.is_empty() { None } else { Some(body) },
        })
    }
}

pub struct InstrumentedTransport {
    client: reqwest::Client,
    interceptors: RwLock<Vec<Arc<dyn TransportInterceptor>>>,
    body_limit: usize,
}

impl InstrumentedTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            interceptors: RwLock::new(Vec::new()),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn TransportInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    /// The underlying client, for building requests
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }

    /// Send `request`, buffer the response and notify interceptors.
    ///
    /// Non-success statuses are returned as responses; use
    /// [`TransportResponse::error_for_status`] to fail on them.
    pub async fn execute(&self, request: reqwest::Request) -> Result<TransportResponse, UpstreamFailure> {
        let method = request.method().to_string();
        let url = request.url().to_string();
        let request_body = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(|bytes| truncate(&String::from_utf8_lossy(bytes), self.body_limit));

        let started = Instant::now();
        let outcome = match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                response
                    .bytes()
                    .await
                    .map(|body| TransportResponse {
                        status,
                        headers,
                        body: body.to_vec(),
                    })
            }
            Err(e) => Err(e),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = NetworkRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            method,
            url,
            status: outcome.as_ref().ok().map(|r| r.status.as_u16()),
            duration_ms,
            request_body,
            response_body: outcome
                .as_ref()
                .ok()
                .filter(|r| !r.body.is_empty())
                .map(|r| truncate(&r.text(), self.body_limit)),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        debug!(
            method = %record.method,
            url = %record.url,
            status = ?record.status,
            duration_ms,
            "Transport exchange completed"
        );
        self.notify(&record);

        outcome.map_err(UpstreamFailure::from)
    }

    /// Send a JSON request and decode a JSON response, failing on non-success.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, UpstreamFailure> {
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let request = builder
            .build()
            .map_err(|e| UpstreamFailure::other(format!("Invalid request: {}", e)))?;
        self.execute(request).await?.error_for_status()?.json()
    }

    fn notify(&self, record: &NetworkRecord) {
        let interceptors = self.interceptors.read().clone();
        for interceptor in interceptors {
            interceptor.on_complete(record);
        }
    }
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}
