//! Durable log store
//!
//! One record per event lands in the remote relational store:
//!
//! | table                     | written by                          |
//! |---------------------------|-------------------------------------|
//! | `error_logs`              | every logged error                  |
//! | `error_fingerprints`      | upsert keyed by `signature`         |
//! | `error_breadcrumbs`       | trail captured with an error        |
//! | `error_recovery_attempts` | recovery manager outcomes           |
//! | `error_snapshots`         | debugger bundles                    |
//!
//! [`HttpLogStore`] speaks the store's REST dialect; [`InMemoryLogStore`]
//! keeps everything in process for tests and offline use.

use crate::error::{GuardrailError, GuardrailResult};
use crate::taxonomy::{ErrorCode, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, Instrument};
use url::Url;
use uuid::Uuid;

pub const ERROR_LOGS: &str = "error_logs";
pub const ERROR_FINGERPRINTS: &str = "error_fingerprints";
pub const ERROR_BREADCRUMBS: &str = "error_breadcrumbs";
pub const ERROR_RECOVERY_ATTEMPTS: &str = "error_recovery_attempts";

/// Rows kept per table by [`InMemoryLogStore`]
pub const DEFAULT_MEMORY_CAPACITY: usize = 1000;
pub const ERROR_SNAPSHOTS: &str = "error_snapshots";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogRecord {
    pub id: Uuid,
    pub code: ErrorCode,
    pub message: String,
    pub user_message: String,
    pub severity: Severity,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub context: Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub signature: String,
    pub code: ErrorCode,
    pub normalized_message: String,
    pub stack_hash: String,
    #[serde(default)]
    pub component_path: Option<String>,
    pub severity_score: u32,
    pub occurrence_count: u64,
    pub affected_user_count: usize,
    pub status: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreadcrumbRecord {
    pub error_log_id: Uuid,
    pub category: String,
    pub level: String,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttemptRecord {
    #[serde(default)]
    pub error_log_id: Option<Uuid>,
    pub strategy: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub error_log_id: Uuid,
    pub snapshot_id: Uuid,
    pub payload: Value,
}

/// Filter for [`LogStore::query_error_logs`]; newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorLogQuery {
    pub code: Option<ErrorCode>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub resolved: Option<bool>,
    pub limit: Option<usize>,
}

impl ErrorLogQuery {
    fn matches(&self, record: &ErrorLogRecord) -> bool {
        self.code.map_or(true, |c| record.code == c)
            && self.severity.map_or(true, |s| record.severity == s)
            && self.since.map_or(true, |since| record.created_at >= since)
            && self.resolved.map_or(true, |r| record.resolved == r)
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> GuardrailResult<Uuid>;

    async fn upsert_fingerprint(&self, record: &FingerprintRecord) -> GuardrailResult<()>;

    async fn insert_breadcrumbs(&self, records: &[BreadcrumbRecord]) -> GuardrailResult<()>;

    async fn insert_recovery_attempt(&self, record: &RecoveryAttemptRecord) -> GuardrailResult<()>;

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> GuardrailResult<()>;

    async fn query_error_logs(&self, query: &ErrorLogQuery) -> GuardrailResult<Vec<ErrorLogRecord>>;

    async fn mark_resolved(&self, id: Uuid) -> GuardrailResult<()>;
}

/// REST client for the hosted store (`/rest/v1/<table>`)
pub struct HttpLogStore {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpLogStore {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> GuardrailResult<Self> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&normalized)
            .map_err(|e| GuardrailError::configuration("store", format!("Invalid store URL: {}", e)))?;
        Ok(Self {
            client,
            base,
            api_key,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn table_url(&self, table: &str, params: &[(&str, String)]) -> GuardrailResult<Url> {
        let mut url = self
            .base
            .join(&format!("rest/v1/{}", table))
            .map_err(|e| GuardrailError::internal(format!("Failed to build URL for {}: {}", table, e)))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, prefer: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .header("Prefer", prefer);
        if let Some(key) = &self.api_key {
            request = request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key));
        }
        request
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> GuardrailResult<reqwest::Response> {
        let response = request
            .send()
            .instrument(tracing::debug_span!("store", operation = %operation))
            .await
            .map_err(|e| GuardrailError::remote(operation, e))?;

        let status = response.status();
        if status.is_success() {
            debug!(operation, status = status.as_u16(), "Store request succeeded");
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(GuardrailError::RemoteStatus {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn insert<T: Serialize + ?Sized + Sync>(&self, table: &str, body: &T) -> GuardrailResult<reqwest::Response> {
        let url = self.table_url(table, &[])?;
        let request = self.request(Method::POST, url, "return=representation").json(body);
        self.send(&format!("insert {}", table), request).await
    }
}

#[async_trait]
impl LogStore for HttpLogStore {
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> GuardrailResult<Uuid> {
        let response = self.insert(ERROR_LOGS, record).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(record.id);
        }
        let rows: Vec<Value> = response.json().await.map_err(|e| GuardrailError::remote("insert error_logs", e))?;
        let id = rows
            .first()
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or(record.id);
        Ok(id)
    }

    async fn upsert_fingerprint(&self, record: &FingerprintRecord) -> GuardrailResult<()> {
        let url = self.table_url(ERROR_FINGERPRINTS, &[("on_conflict", "signature".to_string())])?;
        let request = self
            .request(Method::POST, url, "resolution=merge-duplicates,return=minimal")
            .json(record);
        self.send("upsert error_fingerprints", request).await?;
        Ok(())
    }

    async fn insert_breadcrumbs(&self, records: &[BreadcrumbRecord]) -> GuardrailResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.insert(ERROR_BREADCRUMBS, records).await?;
        Ok(())
    }

    async fn insert_recovery_attempt(&self, record: &RecoveryAttemptRecord) -> GuardrailResult<()> {
        self.insert(ERROR_RECOVERY_ATTEMPTS, record).await?;
        Ok(())
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> GuardrailResult<()> {
        self.insert(ERROR_SNAPSHOTS, record).await?;
        Ok(())
    }

    async fn query_error_logs(&self, query: &ErrorLogQuery) -> GuardrailResult<Vec<ErrorLogRecord>> {
        let mut params = vec![
            ("select", "*".to_string()),
            ("order", "created_at.desc".to_string()),
        ];
        if let Some(code) = query.code {
            params.push(("code", format!("eq.{}", code.as_str())));
        }
        if let Some(severity) = query.severity {
            params.push(("severity", format!("eq.{}", severity)));
        }
        if let Some(since) = query.since {
            params.push(("created_at", format!("gte.{}", since.to_rfc3339())));
        }
        if let Some(resolved) = query.resolved {
            params.push(("resolved", format!("is.{}", resolved)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let url = self.table_url(ERROR_LOGS, &params)?;
        let response = self.send("query error_logs", self.request(Method::GET, url, "count=none")).await?;
        response
            .json()
            .await
            .map_err(|e| GuardrailError::remote("query error_logs", e))
    }

    async fn mark_resolved(&self, id: Uuid) -> GuardrailResult<()> {
        let url = self.table_url(ERROR_LOGS, &[("id", format!("eq.{}", id))])?;
        let body = serde_json::json!({ "resolved": true, "resolved_at": Utc::now() });
        let request = self.request(Method::PATCH, url, "return=minimal").json(&body);
        self.send("resolve error_logs", request).await?;
        Ok(())
    }
}

#[derive(Default)]
struct Tables {
    error_logs: VecDeque<ErrorLogRecord>,
    fingerprints: HashMap<String, FingerprintRecord>,
    breadcrumbs: VecDeque<BreadcrumbRecord>,
    recovery_attempts: VecDeque<RecoveryAttemptRecord>,
    snapshots: VecDeque<SnapshotRecord>,
}

fn push_capped<T>(rows: &mut VecDeque<T>, row: T, capacity: usize) {
    if rows.len() >= capacity {
        rows.pop_front();
    }
    rows.push_back(row);
}

/// Process-local store with per-table failure injection.
///
/// Each table keeps at most `capacity` rows; the oldest rows (least recently
/// seen fingerprints) are dropped first.
pub struct InMemoryLogStore {
    tables: Mutex<Tables>,
    failing: Mutex<HashSet<String>>,
    capacity: usize,
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            failing: Mutex::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    /// Make every write to `table` fail until [`Self::heal`] is called.
    pub fn fail_table(&self, table: &str) {
        self.failing.lock().insert(table.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    fn check(&self, table: &str) -> GuardrailResult<()> {
        if self.failing.lock().contains(table) {
            return Err(GuardrailError::RemoteStatus {
                operation: format!("insert {}", table),
                status: 503,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    pub fn error_logs(&self) -> Vec<ErrorLogRecord> {
        self.tables.lock().error_logs.iter().cloned().collect()
    }

    pub fn fingerprints(&self) -> Vec<FingerprintRecord> {
        self.tables.lock().fingerprints.values().cloned().collect()
    }

    pub fn breadcrumbs(&self) -> Vec<BreadcrumbRecord> {
        self.tables.lock().breadcrumbs.iter().cloned().collect()
    }

    pub fn recovery_attempts(&self) -> Vec<RecoveryAttemptRecord> {
        self.tables.lock().recovery_attempts.iter().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.tables.lock().snapshots.iter().cloned().collect()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> GuardrailResult<Uuid> {
        self.check(ERROR_LOGS)?;
        push_capped(&mut self.tables.lock().error_logs, record.clone(), self.capacity);
        Ok(record.id)
    }

    async fn upsert_fingerprint(&self, record: &FingerprintRecord) -> GuardrailResult<()> {
        self.check(ERROR_FINGERPRINTS)?;
        let mut tables = self.tables.lock();
        let fingerprints = &mut tables.fingerprints;
        if !fingerprints.contains_key(&record.signature) && fingerprints.len() >= self.capacity {
            let stalest = fingerprints
                .values()
                .min_by_key(|f| f.last_seen_at)
                .map(|f| f.signature.clone());
            if let Some(stalest) = stalest {
                fingerprints.remove(&stalest);
            }
        }
        fingerprints.insert(record.signature.clone(), record.clone());
        Ok(())
    }

    async fn insert_breadcrumbs(&self, records: &[BreadcrumbRecord]) -> GuardrailResult<()> {
        self.check(ERROR_BREADCRUMBS)?;
        let mut tables = self.tables.lock();
        for record in records {
            push_capped(&mut tables.breadcrumbs, record.clone(), self.capacity);
        }
        Ok(())
    }

    async fn insert_recovery_attempt(&self, record: &RecoveryAttemptRecord) -> GuardrailResult<()> {
        self.check(ERROR_RECOVERY_ATTEMPTS)?;
        push_capped(&mut self.tables.lock().recovery_attempts, record.clone(), self.capacity);
        Ok(())
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> GuardrailResult<()> {
        self.check(ERROR_SNAPSHOTS)?;
        push_capped(&mut self.tables.lock().snapshots, record.clone(), self.capacity);
        Ok(())
    }

    async fn query_error_logs(&self, query: &ErrorLogQuery) -> GuardrailResult<Vec<ErrorLogRecord>> {
        let tables = self.tables.lock();
        let mut rows: Vec<_> = tables
            .error_logs
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn mark_resolved(&self, id: Uuid) -> GuardrailResult<()> {
        let mut tables = self.tables.lock();
        let record = tables
            .error_logs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| GuardrailError::not_found(format!("error log {}", id)))?;
        record.resolved = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(code: ErrorCode, severity: Severity, minutes_ago: i64) -> ErrorLogRecord {
        ErrorLogRecord {
            id: Uuid::new_v4(),
            code,
            message: "boom".to_string(),
            user_message: "Something went wrong".to_string(),
            severity,
            user_id: None,
            tenant_id: None,
            url: None,
            user_agent: None,
            stack_trace: None,
            fingerprint: None,
            context: json!({}),
            resolved: false,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let store = InMemoryLogStore::new();
        store.insert_error_log(&log(ErrorCode::Network, Severity::High, 30)).await.unwrap();
        store.insert_error_log(&log(ErrorCode::Network, Severity::High, 5)).await.unwrap();
        store.insert_error_log(&log(ErrorCode::Database, Severity::High, 1)).await.unwrap();

        let rows = store
            .query_error_logs(&ErrorLogQuery {
                code: Some(ErrorCode::Network),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].created_at > rows[1].created_at);

        let recent = store
            .query_error_logs(&ErrorLogQuery {
                since: Some(Utc::now() - chrono::Duration::minutes(10)),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].code, ErrorCode::Database);
    }

    #[tokio::test]
    async fn test_mark_resolved() {
        let store = InMemoryLogStore::new();
        let id = store.insert_error_log(&log(ErrorCode::Auth, Severity::High, 0)).await.unwrap();
        store.mark_resolved(id).await.unwrap();

        let unresolved = store
            .query_error_logs(&ErrorLogQuery {
                resolved: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(unresolved.is_empty());
        assert!(store.mark_resolved(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection_is_per_table() {
        let store = InMemoryLogStore::new();
        store.fail_table(ERROR_BREADCRUMBS);

        assert!(store.insert_breadcrumbs(&[]).await.is_err());
        assert!(store.insert_error_log(&log(ErrorCode::Network, Severity::High, 0)).await.is_ok());

        store.heal();
        assert!(store.insert_breadcrumbs(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_tables_are_capped() {
        let store = InMemoryLogStore::with_capacity(3);
        let mut ids = Vec::new();
        for minutes_ago in (0..5).rev() {
            ids.push(store.insert_error_log(&log(ErrorCode::Network, Severity::Low, minutes_ago)).await.unwrap());
        }
        let kept: Vec<Uuid> = store.error_logs().iter().map(|r| r.id).collect();
        assert_eq!(kept, ids[2..].to_vec());

        let crumbs: Vec<BreadcrumbRecord> = (0..4)
            .map(|i| BreadcrumbRecord {
                error_log_id: ids[4],
                category: "navigation".to_string(),
                level: "info".to_string(),
                message: format!("step {}", i),
                data: json!({}),
                timestamp: Utc::now(),
                sequence_number: i,
            })
            .collect();
        store.insert_breadcrumbs(&crumbs).await.unwrap();
        let messages: Vec<String> = store.breadcrumbs().into_iter().map(|b| b.message).collect();
        assert_eq!(messages, vec!["step 1", "step 2", "step 3"]);

        for (i, signature) in ["a", "b", "c", "d"].iter().enumerate() {
            let seen = Utc::now() - chrono::Duration::minutes(10 - i as i64);
            store
                .upsert_fingerprint(&FingerprintRecord {
                    signature: signature.to_string(),
                    code: ErrorCode::Network,
                    normalized_message: "boom".to_string(),
                    stack_hash: "no-stack".to_string(),
                    component_path: None,
                    severity_score: 2,
                    occurrence_count: 1,
                    affected_user_count: 0,
                    status: "active".to_string(),
                    first_seen_at: seen,
                    last_seen_at: seen,
                })
                .await
                .unwrap();
        }
        let mut signatures: Vec<String> = store.fingerprints().into_iter().map(|f| f.signature).collect();
        signatures.sort();
        assert_eq!(signatures, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_table_url_encodes_params() {
        let store = HttpLogStore::new(reqwest::Client::new(), "https://db.example.com/", None).unwrap();
        let url = store
            .table_url(ERROR_FINGERPRINTS, &[("on_conflict", "signature".to_string())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/rest/v1/error_fingerprints?on_conflict=signature"
        );
    }
}
