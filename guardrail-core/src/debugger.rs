//! Debugger and snapshotter
//!
//! On failure the debugger assembles one immutable [`ErrorSnapshot`]: the
//! classified error, recent breadcrumbs, intercepted network calls and
//! console entries, performance counters, environment facts and, when a
//! provider is registered, the application's own state. Snapshots are kept
//! in a capped history; the latest few are mirrored to the local cache.

use crate::breadcrumbs::{Breadcrumb, BreadcrumbCategory, BreadcrumbLevel, BreadcrumbTracker};
use crate::client::NetworkStatus;
use crate::config::DebuggerConfig;
use crate::console_tap::{ConsoleEntry, ConsoleRecorder};
use crate::error::{GuardrailError, GuardrailResult};
use crate::local_cache::{load_json_best_effort, save_json_best_effort, LocalCache, SNAPSHOTS_KEY};
use crate::taxonomy::{ErrorCode, ErrorContext, Severity, TypedError};
use crate::transport::{NetworkRecord, NetworkRecorder};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SLOW_PAGE_LOAD_MS: f64 = 3000.0;
const SLOW_LCP_MS: f64 = 2500.0;
const MAX_CLS: f64 = 0.1;
const MAX_HEAP_RATIO: f64 = 0.8;

/// Timing and memory counters reported by the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_load_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largest_contentful_paint_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_layout_shift: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_limit_bytes: Option<u64>,
    #[serde(default)]
    pub uptime_ms: u64,
    #[serde(default)]
    pub custom: BTreeMap<String, f64>,
}

impl PerformanceMetrics {
    /// Threshold violations, as human-readable lines
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if let Some(ms) = self.page_load_ms.filter(|ms| *ms > SLOW_PAGE_LOAD_MS) {
            issues.push(format!("Slow page load: {:.0}ms", ms));
        }
        if let Some(ms) = self.largest_contentful_paint_ms.filter(|ms| *ms > SLOW_LCP_MS) {
            issues.push(format!("Slow largest contentful paint: {:.0}ms", ms));
        }
        if let Some(cls) = self.cumulative_layout_shift.filter(|cls| *cls > MAX_CLS) {
            issues.push(format!("High cumulative layout shift: {:.2}", cls));
        }
        if let (Some(used), Some(limit)) = (self.heap_used_bytes, self.heap_limit_bytes) {
            if limit > 0 && used as f64 / limit as f64 > MAX_HEAP_RATIO {
                issues.push(format!(
                    "High memory usage: {:.0}% of heap limit",
                    used as f64 * 100.0 / limit as f64
                ));
            }
        }
        issues
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub platform: String,
    pub arch: String,
    pub locale: String,
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<(u32, u32)>,
    pub online: bool,
    pub app_version: String,
}

impl EnvironmentInfo {
    pub fn detect() -> Self {
        let locale = ["LC_ALL", "LANG"]
            .iter()
            .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "en_US".to_string());
        let timezone = std::env::var("TZ")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| chrono::Local::now().offset().to_string());
        Self {
            user_agent: None,
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            locale,
            timezone,
            viewport: None,
            online: true,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Everything known at the moment a failure was captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: TypedError,
    pub context: ErrorContext,
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default)]
    pub application_state: Option<Value>,
    pub recent_network_requests: Vec<NetworkRecord>,
    pub recent_console_entries: Vec<ConsoleEntry>,
    pub performance_metrics: PerformanceMetrics,
    pub environment_info: EnvironmentInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugSummary {
    pub snapshot_id: Uuid,
    pub error_code: ErrorCode,
    pub severity: Severity,
    pub breadcrumb_count: usize,
    pub user_actions: usize,
    pub api_calls: usize,
    pub failed_api_calls: usize,
    pub console_errors: usize,
    pub performance_issues: Vec<String>,
}

type StateProvider = Arc<dyn Fn() -> Value + Send + Sync>;

pub struct Debugger {
    config: DebuggerConfig,
    tracker: Arc<BreadcrumbTracker>,
    network: Arc<NetworkRecorder>,
    console: Arc<ConsoleRecorder>,
    snapshots: Mutex<VecDeque<ErrorSnapshot>>,
    cache: Option<Arc<dyn LocalCache>>,
    state_provider: RwLock<Option<StateProvider>>,
    performance: Mutex<PerformanceMetrics>,
    environment: RwLock<EnvironmentInfo>,
    network_status: Option<watch::Receiver<NetworkStatus>>,
    started: Instant,
}

impl Debugger {
    pub fn new(
        config: DebuggerConfig,
        tracker: Arc<BreadcrumbTracker>,
        network: Arc<NetworkRecorder>,
        console: Arc<ConsoleRecorder>,
    ) -> Self {
        Self {
            config,
            tracker,
            network,
            console,
            snapshots: Mutex::new(VecDeque::new()),
            cache: None,
            state_provider: RwLock::new(None),
            performance: Mutex::new(PerformanceMetrics::default()),
            environment: RwLock::new(EnvironmentInfo::detect()),
            network_status: None,
            started: Instant::now(),
        }
    }

    /// Attach a durable cache and restore previously persisted snapshots.
    pub fn with_cache(mut self, cache: Arc<dyn LocalCache>) -> Self {
        if let Some(restored) = load_json_best_effort::<Vec<ErrorSnapshot>>(cache.as_ref(), SNAPSHOTS_KEY) {
            let mut snapshots = self.snapshots.lock();
            for snapshot in restored {
                snapshots.push_back(snapshot);
            }
            while snapshots.len() > self.config.snapshot_capacity {
                snapshots.pop_front();
            }
            debug!("Restored {} snapshots from local cache", snapshots.len());
        }
        self.cache = Some(cache);
        self
    }

    pub fn with_network_status(mut self, status: watch::Receiver<NetworkStatus>) -> Self {
        self.network_status = Some(status);
        self
    }

    pub fn network(&self) -> &Arc<NetworkRecorder> {
        &self.network
    }

    pub fn console(&self) -> &Arc<ConsoleRecorder> {
        &self.console
    }

    /// Register the callback whose output becomes `application_state`.
    pub fn register_state_provider(&self, provider: impl Fn() -> Value + Send + Sync + 'static) {
        *self.state_provider.write() = Some(Arc::new(provider));
    }

    /// Record a performance counter. Well-known names fill the typed fields;
    /// everything else lands in `custom`. NaN and infinities are rejected
    /// since they cannot round-trip through an exported snapshot.
    pub fn record_metric(&self, name: &str, value: f64) -> GuardrailResult<()> {
        if !value.is_finite() {
            return Err(GuardrailError::invalid_input(
                format!("metric '{}'", name),
                format!("{} is not a finite number", value),
            ));
        }
        let mut metrics = self.performance.lock();
        match name {
            "page_load" | "page_load_ms" => metrics.page_load_ms = Some(value),
            "lcp" | "largest_contentful_paint" => metrics.largest_contentful_paint_ms = Some(value),
            "cls" | "cumulative_layout_shift" => metrics.cumulative_layout_shift = Some(value),
            "heap_used" => metrics.heap_used_bytes = Some(value.max(0.0) as u64),
            "heap_limit" => metrics.heap_limit_bytes = Some(value.max(0.0) as u64),
            other => {
                metrics.custom.insert(other.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn update_environment(&self, update: impl FnOnce(&mut EnvironmentInfo)) {
        update(&mut self.environment.write());
    }

    fn application_state(&self) -> Option<Value> {
        let provider = self.state_provider.read().clone()?;
        match catch_unwind(AssertUnwindSafe(|| provider())) {
            Ok(state) => Some(state),
            Err(_) => {
                warn!("Application state provider panicked; snapshot captured without state");
                None
            }
        }
    }

    /// Capture a snapshot for `error`. Breadcrumbs, environment and
    /// performance sections are always present, possibly empty.
    pub fn capture_snapshot(&self, error: &TypedError, context: Option<&ErrorContext>) -> ErrorSnapshot {
        let context = match context {
            Some(ctx) => ctx.clone().merged_with(error.context()),
            None => error.context().clone(),
        };

        let mut performance = self.performance.lock().clone();
        performance.uptime_ms = self.started.elapsed().as_millis() as u64;

        let mut environment = self.environment.read().clone();
        if let Some(status) = &self.network_status {
            environment.online = *status.borrow() == NetworkStatus::Online;
        }
        if environment.user_agent.is_none() {
            environment.user_agent = context.user_agent.clone();
        }

        let snapshot = ErrorSnapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            error: error.clone(),
            context,
            breadcrumbs: self.tracker.get_last_n(self.config.breadcrumb_limit),
            application_state: self.application_state(),
            recent_network_requests: self.network.recent(self.config.network_capacity),
            recent_console_entries: self.console.recent(self.config.console_capacity),
            performance_metrics: performance,
            environment_info: environment,
        };

        info!(snapshot_id = %snapshot.id, code = %error.code(), "Captured error snapshot");
        self.store(snapshot.clone());
        snapshot
    }

    fn store(&self, snapshot: ErrorSnapshot) {
        let mut snapshots = self.snapshots.lock();
        snapshots.retain(|s| s.id != snapshot.id);
        snapshots.push_back(snapshot);
        while snapshots.len() > self.config.snapshot_capacity {
            snapshots.pop_front();
        }
        if let Some(cache) = &self.cache {
            let skip = snapshots.len().saturating_sub(self.config.persist_count);
            let latest: Vec<&ErrorSnapshot> = snapshots.iter().skip(skip).collect();
            save_json_best_effort(cache.as_ref(), SNAPSHOTS_KEY, &latest);
        }
    }

    pub fn get_snapshot(&self, id: Uuid) -> Option<ErrorSnapshot> {
        self.snapshots.lock().iter().find(|s| s.id == id).cloned()
    }

    fn require(&self, id: Uuid) -> GuardrailResult<ErrorSnapshot> {
        self.get_snapshot(id)
            .ok_or_else(|| GuardrailError::not_found(format!("snapshot {}", id)))
    }

    /// Oldest first
    pub fn snapshots(&self) -> Vec<ErrorSnapshot> {
        self.snapshots.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.snapshots.lock().clear();
        if let Some(cache) = &self.cache {
            save_json_best_effort(cache.as_ref(), SNAPSHOTS_KEY, &Vec::<ErrorSnapshot>::new());
        }
    }

    /// Numbered steps: environment, initial state, user actions in order,
    /// API calls, then the terminal error.
    pub fn generate_reproduction_steps(&self, id: Uuid) -> GuardrailResult<Vec<String>> {
        let snapshot = self.require(id)?;
        let env = &snapshot.environment_info;
        let mut steps = Vec::new();

        let mut environment = format!(
            "Environment: {} ({}), locale {}, timezone {}, {}",
            env.platform,
            env.arch,
            env.locale,
            env.timezone,
            if env.online { "online" } else { "offline" }
        );
        if let Some(agent) = &env.user_agent {
            environment.push_str(&format!(", agent {}", agent));
        }
        if let Some((width, height)) = env.viewport {
            environment.push_str(&format!(", viewport {}x{}", width, height));
        }
        steps.push(environment);

        let start = snapshot
            .breadcrumbs
            .iter()
            .find(|b| b.category == BreadcrumbCategory::Navigation)
            .and_then(|b| b.data.as_ref())
            .and_then(|d| d.get("from"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| snapshot.context.origin_url.clone())
            .or_else(|| snapshot.context.component_path.clone());
        match (&start, &snapshot.application_state) {
            (Some(start), _) => steps.push(format!("Initial state: start at {}", start)),
            (None, Some(Value::Object(state))) => {
                let keys: Vec<&str> = state.keys().map(String::as_str).collect();
                steps.push(format!("Initial state: application state with {}", keys.join(", ")));
            }
            _ => steps.push("Initial state: unknown".to_string()),
        }

        for crumb in &snapshot.breadcrumbs {
            match crumb.category {
                BreadcrumbCategory::Navigation => steps.push(crumb.message.clone()),
                BreadcrumbCategory::UserAction => steps.push(format!("User action: {}", crumb.message)),
                _ => {}
            }
        }

        if snapshot.recent_network_requests.is_empty() {
            for crumb in snapshot
                .breadcrumbs
                .iter()
                .filter(|b| b.category == BreadcrumbCategory::ApiCall)
            {
                steps.push(format!("API call: {}", crumb.message));
            }
        } else {
            for call in &snapshot.recent_network_requests {
                let outcome = match call.status {
                    Some(status) => status.to_string(),
                    None => "no response".to_string(),
                };
                steps.push(format!(
                    "API call: {} {} -> {} ({}ms)",
                    call.method, call.url, outcome, call.duration_ms
                ));
            }
        }

        steps.push(format!(
            "Error: [{}] {}",
            snapshot.error.code(),
            snapshot.error.message()
        ));

        Ok(steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect())
    }

    pub fn get_debug_summary(&self, id: Uuid) -> GuardrailResult<DebugSummary> {
        let snapshot = self.require(id)?;
        let crumbs = &snapshot.breadcrumbs;

        let (api_calls, failed_api_calls) = if snapshot.recent_network_requests.is_empty() {
            let calls: Vec<_> = crumbs
                .iter()
                .filter(|b| b.category == BreadcrumbCategory::ApiCall)
                .collect();
            let failed = calls.iter().filter(|b| b.level == BreadcrumbLevel::Error).count();
            (calls.len(), failed)
        } else {
            let calls = &snapshot.recent_network_requests;
            (calls.len(), calls.iter().filter(|c| c.is_failure()).count())
        };

        Ok(DebugSummary {
            snapshot_id: snapshot.id,
            error_code: snapshot.error.code(),
            severity: snapshot.error.severity(),
            breadcrumb_count: crumbs.len(),
            user_actions: crumbs
                .iter()
                .filter(|b| b.category == BreadcrumbCategory::UserAction)
                .count(),
            api_calls,
            failed_api_calls,
            console_errors: snapshot
                .recent_console_entries
                .iter()
                .filter(|e| e.level == BreadcrumbLevel::Error)
                .count(),
            performance_issues: snapshot.performance_metrics.issues(),
        })
    }

    pub fn export_snapshot(&self, id: Uuid) -> GuardrailResult<String> {
        let snapshot = self.require(id)?;
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Import a previously exported snapshot, replacing any with the same id.
    pub fn import_snapshot(&self, json: &str) -> GuardrailResult<Uuid> {
        let snapshot: ErrorSnapshot = serde_json::from_str(json)?;
        let id = snapshot.id;
        self.store(snapshot);
        info!(snapshot_id = %id, "Imported error snapshot");
        Ok(id)
    }
}
