// End-to-end behavior of the request client and recovery manager

use guardrail_core::client::RequestConfig;
use guardrail_core::recovery::RecoveryOptions;
use guardrail_core::{CircuitBreakerState, ErrorCode, NetworkStatus, TypedError, UpstreamFailure};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{flaky, test_guardrail};

#[tokio::test]
async fn test_concurrent_duplicates_share_one_invocation() {
    let (guardrail, _store) = test_guardrail();
    let client = guardrail.client().clone();
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            client
                .deduplicate("GET /invoices?page=1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, TypedError>(vec![1u32, 2, 3])
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_sequential_duplicates_run_again() {
    let (guardrail, _store) = test_guardrail();
    let client = guardrail.client();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        client
            .deduplicate("key", move || async move {
                Ok::<_, TypedError>(calls.fetch_add(1, Ordering::SeqCst))
            })
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let (guardrail, _store) = test_guardrail();

    let operations: Vec<_> = (0..8u64)
        .map(|i| {
            move || async move {
                // Later items finish first
                tokio::time::sleep(Duration::from_millis(80 - i * 10)).await;
                if i == 3 {
                    Err(UpstreamFailure::http(404, "missing"))
                } else {
                    Ok(i)
                }
            }
        })
        .collect();

    let results = guardrail.client().batch(operations, Some(3)).await;
    assert_eq!(results.len(), 8);
    for (i, result) in results.iter().enumerate() {
        if i == 3 {
            assert_eq!(result.as_ref().unwrap_err().code(), ErrorCode::NotFound);
        } else {
            assert_eq!(*result.as_ref().unwrap(), i as u64);
        }
    }
}

#[rstest]
#[case(UpstreamFailure::transport("connection reset"), 4)]
#[case(UpstreamFailure::http(429, "slow down"), 4)]
#[case(UpstreamFailure::http(401, "jwt expired"), 1)]
#[case(UpstreamFailure::http(422, "bad input"), 1)]
#[tokio::test(start_paused = true)]
async fn test_retry_eligibility_by_code(#[case] failure: UpstreamFailure, #[case] expected_calls: u32) {
    let (guardrail, _store) = test_guardrail();
    let calls = &AtomicU32::new(0);

    let result = guardrail
        .client()
        .invoke(|| flaky(calls, u32::MAX, failure.clone()), None)
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
}

#[tokio::test]
async fn test_failed_request_is_logged_once() {
    let (guardrail, store) = test_guardrail();
    let calls = &AtomicU32::new(0);

    let _ = guardrail
        .client()
        .mutate(
            || flaky(calls, u32::MAX, UpstreamFailure::store("23505", "duplicate key")),
            Some(RequestConfig::new().operation_name("create invoice")),
        )
        .await;
    let _ = guardrail
        .client()
        .mutate(
            || flaky(calls, u32::MAX, UpstreamFailure::store("23505", "duplicate key")),
            Some(RequestConfig::new().suppress_logging()),
        )
        .await;

    guardrail.logger().flush().await;
    let logs = store.error_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].code, ErrorCode::Database);
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_flips_status() {
    let (guardrail, _store) = test_guardrail();
    let client = guardrail.client();
    let status = client.network_status();
    let calls = &AtomicU32::new(0);

    let _ = client
        .query(
            || flaky(calls, u32::MAX, UpstreamFailure::transport("dns lookup failed")),
            Some(RequestConfig::new().max_retries(0)),
        )
        .await;
    assert_eq!(*status.borrow(), NetworkStatus::Offline);

    client
        .query(|| flaky(calls, 0, UpstreamFailure::other("unused")), None)
        .await
        .unwrap();
    assert_eq!(*status.borrow(), NetworkStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_retry_then_stats() {
    let (guardrail, store) = test_guardrail();
    let recovery = guardrail.recovery();
    let original = TypedError::network("socket hang up");

    let calls = &AtomicU32::new(0);
    let value = recovery
        .attempt_recovery(
            || flaky(calls, 2, UpstreamFailure::transport("reset")),
            &original,
            RecoveryOptions::retry(),
        )
        .await
        .unwrap();
    assert_eq!(value, 3);

    let calls = &AtomicU32::new(0);
    let failed = recovery
        .attempt_recovery(
            || flaky(calls, u32::MAX, UpstreamFailure::transport("reset")),
            &original,
            RecoveryOptions::retry().max_attempts(2),
        )
        .await;
    assert!(failed.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = recovery.get_recovery_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 50.0);

    guardrail.logger().flush().await;
    assert_eq!(store.recovery_attempts().len(), 2);
}

#[tokio::test]
async fn test_recovery_breaker_is_keyed_by_integration() {
    let (guardrail, _store) = test_guardrail();
    let recovery = guardrail.recovery();
    let original = TypedError::integration("stripe", "card processor unavailable");

    for _ in 0..5 {
        let calls = &AtomicU32::new(0);
        let _ = recovery
            .attempt_recovery(
                || flaky(calls, u32::MAX, UpstreamFailure::http(503, "unavailable")),
                &original,
                RecoveryOptions::circuit_breaker(),
            )
            .await;
    }

    let breaker = guardrail.breakers().get("stripe").unwrap();
    assert_eq!(breaker.state(), CircuitBreakerState::Open);

    let calls = &AtomicU32::new(0);
    let rejected = recovery
        .attempt_recovery(
            || flaky(calls, 0, UpstreamFailure::other("unused")),
            &original,
            RecoveryOptions::circuit_breaker(),
        )
        .await
        .unwrap_err();
    assert_eq!(rejected.code(), ErrorCode::ServiceUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
