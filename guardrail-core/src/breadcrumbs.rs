//! Breadcrumb tracker
//!
//! An append-only, size-bounded ring buffer of operational events used to
//! reconstruct what happened before a failure. The oldest entry is evicted on
//! overflow. After every mutation the latest entries are written to the local
//! cache so the trail survives a restart.

use crate::local_cache::{load_json_best_effort, save_json_best_effort, LocalCache, BREADCRUMBS_KEY};
use crate::taxonomy::TypedError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_PERSIST_COUNT: usize = 50;

const MAX_COLLECTION_ITEMS: usize = 10;
const MAX_STRING_CHARS: usize = 100;
const MAX_SANITIZE_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbCategory {
    Navigation,
    UserAction,
    ApiCall,
    StateChange,
    Console,
    Error,
    Performance,
}

impl fmt::Display for BreadcrumbCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreadcrumbCategory::Navigation => "navigation",
            BreadcrumbCategory::UserAction => "user_action",
            BreadcrumbCategory::ApiCall => "api_call",
            BreadcrumbCategory::StateChange => "state_change",
            BreadcrumbCategory::Console => "console",
            BreadcrumbCategory::Error => "error",
            BreadcrumbCategory::Performance => "performance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreadcrumbLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for BreadcrumbLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreadcrumbLevel::Debug => "debug",
            BreadcrumbLevel::Info => "info",
            BreadcrumbLevel::Warning => "warning",
            BreadcrumbLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// One recorded operational event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: BreadcrumbCategory,
    pub level: BreadcrumbLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Monotonic insertion order, also persisted as `sequenceNumber`
    #[serde(default)]
    pub sequence: u64,
}

/// Filter for [`BreadcrumbTracker::query`]
#[derive(Debug, Clone, Default)]
pub struct BreadcrumbQuery {
    pub category: Option<BreadcrumbCategory>,
    pub level: Option<BreadcrumbLevel>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

struct TrackerState {
    entries: VecDeque<Breadcrumb>,
    next_sequence: u64,
}

/// Bounded, insertion-ordered breadcrumb buffer
pub struct BreadcrumbTracker {
    state: Mutex<TrackerState>,
    capacity: usize,
    persist_count: usize,
    cache: Option<Arc<dyn LocalCache>>,
}

impl Default for BreadcrumbTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BreadcrumbTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                entries: VecDeque::with_capacity(capacity),
                next_sequence: 0,
            }),
            capacity: capacity.max(1),
            persist_count: DEFAULT_PERSIST_COUNT.min(capacity.max(1)),
            cache: None,
        }
    }

    /// Attach a durable cache and restore whatever it holds.
    pub fn with_cache(mut self, cache: Arc<dyn LocalCache>, persist_count: usize) -> Self {
        self.persist_count = persist_count.min(self.capacity);
        if let Some(restored) = load_json_best_effort::<Vec<Breadcrumb>>(cache.as_ref(), BREADCRUMBS_KEY) {
            let mut state = self.state.lock();
            let skip = restored.len().saturating_sub(self.capacity);
            for crumb in restored.into_iter().skip(skip) {
                state.next_sequence = state.next_sequence.max(crumb.sequence + 1);
                state.entries.push_back(crumb);
            }
        }
        self.cache = Some(cache);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one breadcrumb, evicting the oldest on overflow.
    pub fn record(
        &self,
        category: BreadcrumbCategory,
        level: BreadcrumbLevel,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Breadcrumb {
        let mut state = self.state.lock();
        let crumb = Breadcrumb {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category,
            level,
            message: message.into(),
            data,
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;

        if state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(crumb.clone());
        self.persist_locked(&state);
        crumb
    }

    pub fn navigation(&self, from: &str, to: &str) -> Breadcrumb {
        self.record(
            BreadcrumbCategory::Navigation,
            BreadcrumbLevel::Info,
            format!("Navigated from {} to {}", from, to),
            Some(json!({ "from": from, "to": to })),
        )
    }

    pub fn user_action(&self, action: &str, target: Option<&str>, data: Option<Value>) -> Breadcrumb {
        let message = match target {
            Some(target) => format!("{} on {}", action, target),
            None => action.to_string(),
        };
        let mut payload = Map::new();
        payload.insert("action".into(), json!(action));
        if let Some(target) = target {
            payload.insert("target".into(), json!(target));
        }
        if let Some(data) = data {
            payload.insert("data".into(), sanitize(&data));
        }
        self.record(
            BreadcrumbCategory::UserAction,
            BreadcrumbLevel::Info,
            message,
            Some(Value::Object(payload)),
        )
    }

    /// Level escalates to `error` for status >= 400.
    pub fn api_call(&self, method: &str, url: &str, status: u16, duration_ms: u64) -> Breadcrumb {
        let level = if status >= 400 {
            BreadcrumbLevel::Error
        } else {
            BreadcrumbLevel::Info
        };
        self.record(
            BreadcrumbCategory::ApiCall,
            level,
            format!("{} {} -> {}", method, url, status),
            Some(json!({
                "method": method,
                "url": url,
                "status": status,
                "duration_ms": duration_ms,
            })),
        )
    }

    /// Values are sanitized before they are stored.
    pub fn state_change(&self, description: &str, previous: &Value, next: &Value) -> Breadcrumb {
        self.record(
            BreadcrumbCategory::StateChange,
            BreadcrumbLevel::Info,
            description,
            Some(json!({
                "previous": sanitize(previous),
                "next": sanitize(next),
            })),
        )
    }

    pub fn performance(&self, metric: &str, value: f64, unit: &str) -> Breadcrumb {
        self.record(
            BreadcrumbCategory::Performance,
            BreadcrumbLevel::Info,
            format!("{}: {}{}", metric, value, unit),
            Some(json!({ "metric": metric, "value": value, "unit": unit })),
        )
    }

    pub fn console(&self, level: BreadcrumbLevel, message: impl Into<String>, target: &str) -> Breadcrumb {
        self.record(
            BreadcrumbCategory::Console,
            level,
            message,
            Some(json!({ "target": target })),
        )
    }

    pub fn error(&self, error: &TypedError) -> Breadcrumb {
        self.record(
            BreadcrumbCategory::Error,
            BreadcrumbLevel::Error,
            error.message(),
            Some(json!({
                "code": error.code().as_str(),
                "severity": error.severity().to_string(),
            })),
        )
    }

    /// Filtered view in insertion order
    pub fn query(&self, query: &BreadcrumbQuery) -> Vec<Breadcrumb> {
        let state = self.state.lock();
        let matches: Vec<Breadcrumb> = state
            .entries
            .iter()
            .filter(|c| query.category.map_or(true, |cat| c.category == cat))
            .filter(|c| query.level.map_or(true, |lvl| c.level == lvl))
            .filter(|c| query.since.map_or(true, |since| c.timestamp >= since))
            .cloned()
            .collect();
        match query.limit {
            Some(limit) if matches.len() > limit => matches[matches.len() - limit..].to_vec(),
            _ => matches,
        }
    }

    pub fn all(&self) -> Vec<Breadcrumb> {
        self.state.lock().entries.iter().cloned().collect()
    }

    pub fn get_last_n(&self, n: usize) -> Vec<Breadcrumb> {
        let state = self.state.lock();
        let skip = state.entries.len().saturating_sub(n);
        state.entries.iter().skip(skip).cloned().collect()
    }

    /// The last `n` breadcrumbs recorded strictly before `timestamp`
    pub fn get_before_timestamp(&self, timestamp: DateTime<Utc>, n: usize) -> Vec<Breadcrumb> {
        let state = self.state.lock();
        let before: Vec<&Breadcrumb> = state
            .entries
            .iter()
            .filter(|c| c.timestamp < timestamp)
            .collect();
        let skip = before.len().saturating_sub(n);
        before.into_iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        self.persist_locked(&state);
    }

    fn persist_locked(&self, state: &TrackerState) {
        let Some(cache) = &self.cache else {
            return;
        };
        let skip = state.entries.len().saturating_sub(self.persist_count);
        let latest: Vec<&Breadcrumb> = state.entries.iter().skip(skip).collect();
        save_json_best_effort(cache.as_ref(), BREADCRUMBS_KEY, &latest);
    }
}

/// Bound the size of arbitrary values before they are stored.
///
/// Arrays over 10 elements and objects over 10 keys are replaced with a
/// summary string; strings over 100 characters are truncated.
pub fn sanitize(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_SANITIZE_DEPTH {
        return Value::String("[Max depth reached]".to_string());
    }
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_CHARS => {
            let truncated: String = s.chars().take(MAX_STRING_CHARS).collect();
            Value::String(format!("{}...", truncated))
        }
        Value::Array(items) if items.len() > MAX_COLLECTION_ITEMS => {
            Value::String(format!("[Array({})]", items.len()))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| sanitize_at(v, depth + 1)).collect()),
        Value::Object(map) if map.len() > MAX_COLLECTION_ITEMS => {
            Value::String(format!("[Object with {} keys]", map.len()))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_at(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}
