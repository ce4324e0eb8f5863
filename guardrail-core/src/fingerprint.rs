//! Error fingerprinting and aggregation
//!
//! A fingerprint identifies "the same underlying bug" across raw occurrences.
//! Messages are normalized so that embedded data (ids, timestamps, numbers,
//! quoted values, URLs, emails) does not split one bug into many signatures.
//! Repeat occurrences mutate the existing record in place: at most one live
//! record exists per signature.

use crate::taxonomy::{ErrorCode, ErrorContext, Severity, TypedError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

const STACK_LINES: usize = 5;
const SIGNATURE_MESSAGE_CHARS: usize = 100;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\b(?:https?|wss?)://[^\s"'<>]+"#).unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});
static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?")
        .unwrap()
});
static QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]*"|`[^`]*`"#).unwrap());
// Digits glued to a preceding word character belong to an identifier (invoices_v2)
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static LINE_COL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+(?::\d+)?").unwrap());
static JS_COMPONENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"at\s+([A-Z][A-Za-z0-9_]*)").unwrap());
static RUST_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[A-Za-z_][A-Za-z0-9_]*::)+[A-Za-z_][A-Za-z0-9_]*").unwrap());

/// Aggregated record for one signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    pub id: String,
    pub normalized_message: String,
    pub error_code: ErrorCode,
    pub stack_hash: String,
    pub component_path: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub affected_users: FxHashSet<String>,
    pub affected_tenants: FxHashSet<String>,
    /// Highest severity observed for this signature
    pub severity: Severity,
    /// Raw message of the most recent occurrence
    pub last_message: String,
}

/// Aggregate statistics across all live fingerprints
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FingerprintStats {
    pub unique_errors: usize,
    pub total_occurrences: u64,
    pub affected_users: usize,
    pub affected_tenants: usize,
    pub by_code: HashMap<ErrorCode, u64>,
    pub by_severity: HashMap<Severity, u64>,
}

/// Signature computation plus the live aggregation map
pub struct FingerprintEngine {
    records: Mutex<FxHashMap<String, ErrorFingerprint>>,
    stale_after: Duration,
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl FingerprintEngine {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            records: Mutex::new(FxHashMap::default()),
            stale_after,
        }
    }

    /// Compute the signature for `error` and merge this occurrence into its
    /// record. Returns the signature id.
    pub fn fingerprint(&self, error: &TypedError, context: Option<&ErrorContext>) -> String {
        let normalized = normalize_message(error.message());
        let stack_hash = hash_stack(error.stack());
        let component = context
            .and_then(|c| c.component_path.clone())
            .or_else(|| error.context().component_path.clone())
            .or_else(|| extract_component(error.stack()));
        let id = signature(error.code(), &normalized, &stack_hash, component.as_deref());

        let user = context
            .and_then(|c| c.user_id.clone())
            .or_else(|| error.context().user_id.clone());
        let tenant = context
            .and_then(|c| c.tenant_id.clone())
            .or_else(|| error.context().tenant_id.clone());
        let now = Utc::now();

        let mut records = self.records.lock();
        let record = records.entry(id.clone()).or_insert_with(|| {
            debug!(fingerprint = %id, code = %error.code(), "New error fingerprint");
            ErrorFingerprint {
                id: id.clone(),
                normalized_message: normalized,
                error_code: error.code(),
                stack_hash,
                component_path: component,
                first_seen: now,
                last_seen: now,
                occurrence_count: 0,
                affected_users: FxHashSet::default(),
                affected_tenants: FxHashSet::default(),
                severity: error.severity(),
                last_message: String::new(),
            }
        });
        record.occurrence_count += 1;
        record.last_seen = now;
        record.last_message = error.message().to_string();
        record.severity = record.severity.max(error.severity());
        if let Some(user) = user {
            record.affected_users.insert(user);
        }
        if let Some(tenant) = tenant {
            record.affected_tenants.insert(tenant);
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<ErrorFingerprint> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `n` signatures with the most occurrences
    pub fn most_frequent(&self, n: usize) -> Vec<ErrorFingerprint> {
        let mut all: Vec<ErrorFingerprint> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then(b.last_seen.cmp(&a.last_seen))
        });
        all.truncate(n);
        all
    }

    /// Signatures seen within the last `minutes`, most recent first
    pub fn recent(&self, minutes: i64) -> Vec<ErrorFingerprint> {
        let cutoff = Utc::now() - ChronoDuration::minutes(minutes);
        let mut recent: Vec<ErrorFingerprint> = self
            .records
            .lock()
            .values()
            .filter(|r| r.last_seen >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        recent
    }

    pub fn by_code(&self, code: ErrorCode) -> Vec<ErrorFingerprint> {
        let mut matching: Vec<ErrorFingerprint> = self
            .records
            .lock()
            .values()
            .filter(|r| r.error_code == code)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
        matching
    }

    pub fn stats(&self) -> FingerprintStats {
        let records = self.records.lock();
        let mut stats = FingerprintStats {
            unique_errors: records.len(),
            ..Default::default()
        };
        let mut users = BTreeSet::new();
        let mut tenants = BTreeSet::new();
        for record in records.values() {
            stats.total_occurrences += record.occurrence_count;
            *stats.by_code.entry(record.error_code).or_default() += record.occurrence_count;
            *stats.by_severity.entry(record.severity).or_default() += record.occurrence_count;
            users.extend(record.affected_users.iter().cloned());
            tenants.extend(record.affected_tenants.iter().cloned());
        }
        stats.affected_users = users.len();
        stats.affected_tenants = tenants.len();
        stats
    }

    /// Drop records with no activity within the stale window.
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(Utc::now())
    }

    pub fn evict_stale_at(&self, now: DateTime<Utc>) -> usize {
        let window = ChronoDuration::from_std(self.stale_after).unwrap_or_else(|_| ChronoDuration::days(1));
        let cutoff = now - window;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.last_seen >= cutoff);
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "Evicted stale error fingerprints");
        }
        evicted
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

/// Replace embedded data with placeholder tokens, then lowercase and trim.
pub fn normalize_message(message: &str) -> String {
    let s = URL_RE.replace_all(message, "<url>");
    let s = EMAIL_RE.replace_all(&s, "<email>");
    let s = UUID_RE.replace_all(&s, "<uuid>");
    let s = TIMESTAMP_RE.replace_all(&s, "<timestamp>");
    let s = QUOTED_RE.replace_all(&s, "<str>");
    let s = replace_single_quoted(&s);
    let s = NUMBER_RE.replace_all(&s, "<n>");
    let s = WHITESPACE_RE.replace_all(&s, " ");
    s.trim().to_lowercase()
}

/// Hash the first few stack lines with line/column numbers removed.
pub fn hash_stack(stack: Option<&str>) -> String {
    let Some(stack) = stack else {
        return "no-stack".to_string();
    };
    let mut hasher = blake3::Hasher::new();
    for line in stack
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(STACK_LINES)
    {
        hasher.update(LINE_COL_RE.replace_all(line, "").as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize().as_bytes()[..8])
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace `'...'` spans whose quotes sit outside words. Apostrophes in
/// contractions and possessives (can't, user's) are left alone.
fn replace_single_quoted(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        let opens = chars[i] == '\'' && (i == 0 || !is_word_char(chars[i - 1]));
        if opens {
            let close = (i + 1..chars.len())
                .find(|&j| chars[j] == '\'' && chars.get(j + 1).map_or(true, |c| !is_word_char(*c)));
            if let Some(close) = close {
                out.push_str("<str>");
                i = close + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Best-effort originating component from a stack trace
pub fn extract_component(stack: Option<&str>) -> Option<String> {
    let stack = stack?;
    for line in stack.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = JS_COMPONENT_RE.captures(line) {
            return Some(caps[1].to_string());
        }
        if let Some(path) = RUST_PATH_RE.find(line) {
            let segments: Vec<&str> = path.as_str().split("::").collect();
            let tail = segments.len().saturating_sub(2);
            return Some(segments[tail..].join("::"));
        }
    }
    None
}

fn signature(code: ErrorCode, normalized: &str, stack_hash: &str, component: Option<&str>) -> String {
    let truncated: String = normalized.chars().take(SIGNATURE_MESSAGE_CHARS).collect();
    let mut hasher = blake3::Hasher::new();
    hasher.update(code.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(truncated.as_bytes());
    hasher.update(b"|");
    hasher.update(stack_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(component.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_replaces_embedded_data() {
        let msg = r#"Order 1234 for "ACME Corp" failed at 2024-03-01T10:20:30.123Z (id 550e8400-e29b-41d4-a716-446655440000) see https://app.example.com/orders/1234 contact ops@example.com"#;
        assert_eq!(
            normalize_message(msg),
            "order <n> for <str> failed at <timestamp> (id <uuid>) see <url> contact <email>"
        );
    }

    #[test]
    fn test_same_signature_for_different_data() {
        let engine = FingerprintEngine::default();
        let a = engine.fingerprint(&TypedError::database("Invoice 17 not saved for user 'alice'"), None);
        let b = engine.fingerprint(&TypedError::database("Invoice 9001 not saved for user 'bob'"), None);
        assert_eq!(a, b);
        assert_eq!(engine.get(&a).unwrap().occurrence_count, 2);
    }

    #[test]
    fn test_apostrophes_are_not_quotes() {
        assert_eq!(
            normalize_message("Can't save invoice: user's session expired"),
            "can't save invoice: user's session expired"
        );

        let engine = FingerprintEngine::default();
        let a = engine.fingerprint(&TypedError::database("Can't save invoice: user's session expired"), None);
        let b = engine.fingerprint(
            &TypedError::database("Can't delete warranty claim: user's session expired"),
            None,
        );
        assert_ne!(a, b);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_quoted_value_with_inner_apostrophe() {
        assert_eq!(
            normalize_message("title 'Bob's invoice' already exists"),
            "title <str> already exists"
        );
    }

    #[test]
    fn test_digits_inside_identifiers_are_kept() {
        assert_eq!(normalize_message("table invoices_v2 is locked"), "table invoices_v2 is locked");
        assert_ne!(
            normalize_message("table invoices_v2 is locked"),
            normalize_message("table invoices_v3 is locked")
        );
        assert_eq!(normalize_message("query took 5000ms"), "query took <n>ms");
    }

    #[test]
    fn test_code_and_stack_split_signatures() {
        let engine = FingerprintEngine::default();
        let a = engine.fingerprint(&TypedError::database("boom"), None);
        let b = engine.fingerprint(&TypedError::network("boom"), None);
        let c = engine.fingerprint(&TypedError::database("boom").with_stack("at InvoiceForm (form.js:10:4)"), None);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_stack_hash_ignores_line_numbers() {
        let a = hash_stack(Some("at save (invoice.js:10:5)\nat submit (form.js:22:1)"));
        let b = hash_stack(Some("at save (invoice.js:11:9)\nat submit (form.js:40:3)"));
        assert_eq!(a, b);
        assert_eq!(hash_stack(None), "no-stack");
    }

    #[test]
    fn test_stack_hash_is_stable() {
        // Persisted remotely, so the value must not depend on the platform hasher
        let hash = hash_stack(Some("at save (invoice.js:10:5)"));
        let expected = hex::encode(&blake3::hash(b"at save (invoice.js)\n").as_bytes()[..8]);
        assert_eq!(hash, expected);
        assert_eq!(hash.len(), 16);
    }

    #[test]
    fn test_stack_hash_uses_first_five_lines() {
        let base = "a\nb\nc\nd\ne";
        assert_eq!(hash_stack(Some(&format!("{}\nf", base))), hash_stack(Some(&format!("{}\ng", base))));
    }

    #[test]
    fn test_extract_component() {
        assert_eq!(
            extract_component(Some("Error: x\n    at InvoiceForm (src/InvoiceForm.tsx:12:3)")),
            Some("InvoiceForm".to_string())
        );
        assert_eq!(
            extract_component(Some("   0: billing::invoices::submit\n at src/invoices.rs:40:9")),
            Some("invoices::submit".to_string())
        );
        assert_eq!(extract_component(None), None);
    }

    #[test]
    fn test_occurrences_and_distinct_users() {
        let engine = FingerprintEngine::default();
        let err = TypedError::timeout("query took 5000ms");
        let mut id = String::new();
        for user in ["u1", "u2", "u1", "u3", "u2"] {
            let ctx = ErrorContext::new().with_user(user).with_tenant("acme");
            id = engine.fingerprint(&err, Some(&ctx));
        }
        let record = engine.get(&id).unwrap();
        assert_eq!(record.occurrence_count, 5);
        assert_eq!(record.affected_users.len(), 3);
        assert_eq!(record.affected_tenants.len(), 1);
    }

    #[test]
    fn test_ranking_and_filters() {
        let engine = FingerprintEngine::default();
        for _ in 0..3 {
            engine.fingerprint(&TypedError::network("Failed to fetch"), None);
        }
        engine.fingerprint(&TypedError::validation("email is invalid"), None);

        let top = engine.most_frequent(1);
        assert_eq!(top[0].error_code, ErrorCode::Network);
        assert_eq!(engine.by_code(ErrorCode::Validation).len(), 1);
        assert_eq!(engine.recent(5).len(), 2);

        let stats = engine.stats();
        assert_eq!(stats.unique_errors, 2);
        assert_eq!(stats.total_occurrences, 4);
        assert_eq!(stats.by_code[&ErrorCode::Network], 3);
    }

    #[test]
    fn test_stale_eviction() {
        let engine = FingerprintEngine::default();
        engine.fingerprint(&TypedError::unknown("x"), None);
        assert_eq!(engine.evict_stale(), 0);
        assert_eq!(engine.evict_stale_at(Utc::now() + ChronoDuration::hours(25)), 1);
        assert!(engine.is_empty());
    }

    proptest! {
        #[test]
        fn prop_embedded_numbers_do_not_change_signature(a in 0u64..10_000_000, b in 0u64..10_000_000) {
            let engine = FingerprintEngine::default();
            let x = engine.fingerprint(&TypedError::database(format!("row {} locked by job {}", a, b)), None);
            let y = engine.fingerprint(&TypedError::database(format!("row {} locked by job {}", b, a)), None);
            prop_assert_eq!(x, y);
        }

        #[test]
        fn prop_embedded_quoted_values_do_not_change_signature(s in "[a-zA-Z0-9 ]{0,20}") {
            prop_assert_eq!(
                normalize_message(&format!("unknown field '{}' in payload", s)),
                "unknown field <str> in payload"
            );
        }
    }
}
