// Breadcrumbs, snapshots and the logging drain across the wired components

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use guardrail_core::client::RequestConfig;
use guardrail_core::store::InMemoryLogStore;
use guardrail_core::{BreadcrumbCategory, BreadcrumbLevel, ErrorCode, Guardrail, GuardrailConfig, TypedError};
use pretty_assertions::assert_eq;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

mod common;
use common::{test_guardrail, test_guardrail_with, wait_for_condition, TEST_TIMEOUT};

#[test]
fn test_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = GuardrailConfig::default();
    config.cache.path = Some(dir.path().join("guardrail.redb"));

    let snapshot_id = {
        let (guardrail, _store) = test_guardrail_with(config.clone());
        guardrail.breadcrumbs().navigation("/", "/invoices");
        guardrail
            .breadcrumbs()
            .user_action("click", Some("button#pay"), None);
        guardrail
            .debugger()
            .capture_snapshot(&TypedError::not_found("Invoice 42 not found"), None)
            .id
    };

    let (guardrail, _store) = test_guardrail_with(config);
    let crumbs = guardrail.breadcrumbs().all();
    assert_eq!(crumbs.len(), 2);
    assert_eq!(crumbs[0].category, BreadcrumbCategory::Navigation);

    let snapshot = guardrail.debugger().get_snapshot(snapshot_id).unwrap();
    assert_eq!(snapshot.error.code(), ErrorCode::NotFound);

    // Sequence numbers continue after restored entries
    let next = guardrail.breadcrumbs().navigation("/invoices", "/settings");
    assert!(next.sequence > crumbs[1].sequence);
}

#[test]
fn test_snapshot_export_import_between_instances() {
    let (source, _) = test_guardrail();
    source.breadcrumbs().navigation("/", "/settings");
    source
        .breadcrumbs()
        .user_action("submit", Some("form#profile"), None);
    source.debugger().register_state_provider(|| json!({ "user": { "plan": "pro" } }));
    let snapshot = source
        .debugger()
        .capture_snapshot(&TypedError::validation("email is invalid"), None);
    let exported = source.debugger().export_snapshot(snapshot.id).unwrap();

    let (target, _) = test_guardrail();
    let imported = target.debugger().import_snapshot(&exported).unwrap();
    assert_eq!(imported, snapshot.id);
    assert_eq!(target.debugger().get_snapshot(imported).unwrap(), snapshot);

    let steps = target.debugger().generate_reproduction_steps(imported).unwrap();
    assert_eq!(steps, source.debugger().generate_reproduction_steps(snapshot.id).unwrap());
    assert!(steps[0].starts_with("1. Environment:"));
    assert_eq!(steps[1], "2. Initial state: start at /");
    assert_eq!(steps[2], "3. Navigated from / to /settings");
    assert_eq!(steps[3], "4. User action: submit on form#profile");
    assert_eq!(steps.last().unwrap(), "5. Error: [VALIDATION_ERROR] email is invalid");
}

#[test]
fn test_import_rejects_malformed_json() {
    let (guardrail, _) = test_guardrail();
    assert!(guardrail.debugger().import_snapshot("{\"id\": 1").is_err());
    assert!(guardrail.debugger().snapshots().is_empty());
}

#[tokio::test]
async fn test_transport_calls_reach_snapshot() {
    let app = Router::new()
        .route("/invoices", get(|| async { Json(json!([{ "id": "inv-1" }])) }))
        .route(
            "/flaky",
            get(|| async { (StatusCode::BAD_GATEWAY, Json(json!({ "message": "upstream down" }))) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (guardrail, store) = test_guardrail();
    let transport = guardrail.transport().clone();
    let invoices_url = format!("{}/invoices", base);
    let flaky_url = format!("{}/flaky", base);

    let invoices: Value = transport.send_json(Method::GET, &invoices_url, None).await.unwrap();
    assert_eq!(invoices[0]["id"], json!("inv-1"));

    let err = guardrail
        .client()
        .query(
            || transport.send_json::<Value>(Method::GET, &flaky_url, None),
            Some(RequestConfig::new().operation_name("load flaky").max_retries(0)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Network);
    assert_eq!(err.message(), "upstream down");

    let snapshot = guardrail.debugger().snapshots().pop().unwrap();
    let statuses: Vec<Option<u16>> = snapshot.recent_network_requests.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![Some(200), Some(502)]);

    let summary = guardrail.debugger().get_debug_summary(snapshot.id).unwrap();
    assert_eq!(summary.api_calls, 2);
    assert_eq!(summary.failed_api_calls, 1);

    let steps = guardrail.debugger().generate_reproduction_steps(snapshot.id).unwrap();
    assert!(steps
        .iter()
        .any(|s| s.contains(&format!("API call: GET {} -> 502", flaky_url))));

    let failed_crumbs = guardrail
        .breadcrumbs()
        .all()
        .into_iter()
        .filter(|b| b.category == BreadcrumbCategory::ApiCall && b.level == BreadcrumbLevel::Error)
        .count();
    // One from the transport, one from the client
    assert_eq!(failed_crumbs, 2);

    guardrail.logger().flush().await;
    assert_eq!(store.error_logs().len(), 1);
}

#[test]
fn test_console_tap_feeds_breadcrumbs() {
    let (guardrail, _) = test_guardrail();
    let subscriber = Registry::default().with(guardrail.console_tap());

    tracing::subscriber::with_default(subscriber, || {
        tracing::error!(target: "billing::sync", attempt = 3, "ledger sync failed");
    });

    let crumbs = guardrail.breadcrumbs().all();
    assert_eq!(crumbs.len(), 1);
    assert_eq!(crumbs[0].category, BreadcrumbCategory::Console);
    assert_eq!(crumbs[0].level, BreadcrumbLevel::Error);

    let snapshot = guardrail
        .debugger()
        .capture_snapshot(&TypedError::internal("sync aborted"), None);
    assert_eq!(snapshot.recent_console_entries.len(), 1);
    assert!(snapshot.recent_console_entries[0].message.contains("attempt=3"));
}

#[tokio::test]
async fn test_background_drain_persists_without_flush() {
    let mut config = GuardrailConfig::default();
    config.logger.drain_interval = Duration::from_millis(20);
    let store = Arc::new(InMemoryLogStore::new());
    let guardrail = Guardrail::builder(config).log_store(store.clone()).build().unwrap();
    guardrail.start();

    guardrail
        .logger()
        .log_error(&TypedError::rate_limit("too many requests"), None, None);
    assert!(wait_for_condition(|| store.error_logs().len() == 1, TEST_TIMEOUT).await);

    guardrail
        .logger()
        .log_error(&TypedError::rate_limit("too many requests"), None, None);
    guardrail.shutdown().await;
    assert_eq!(store.error_logs().len(), 2);
    assert_eq!(guardrail.logger().pending(), 0);
}
