// Common helpers for integration tests

#![allow(dead_code)]

use guardrail_core::store::InMemoryLogStore;
use guardrail_core::{Guardrail, GuardrailConfig, UpstreamFailure};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fully wired instance backed by an in-memory store
pub fn test_guardrail() -> (Guardrail, Arc<InMemoryLogStore>) {
    test_guardrail_with(GuardrailConfig::default())
}

pub fn test_guardrail_with(config: GuardrailConfig) -> (Guardrail, Arc<InMemoryLogStore>) {
    let store = Arc::new(InMemoryLogStore::new());
    let guardrail = Guardrail::builder(config)
        .log_store(store.clone())
        .build()
        .expect("default configuration is valid");
    (guardrail, store)
}

/// Operation that fails with `failure` for the first `failures` calls
pub async fn flaky(calls: &AtomicU32, failures: u32, failure: UpstreamFailure) -> Result<u32, UpstreamFailure> {
    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= failures {
        Err(failure)
    } else {
        Ok(n)
    }
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
