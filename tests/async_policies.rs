//! Async executor behavior, timed with a paused tokio clock.

use futures::future::BoxFuture;
use integrations_sql_resilience::{
    CircuitState, ConfigurationError, Failure, PolicyBuilder, PolicyError, RetryConfig,
    TimeoutScope,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

/// Fails with the given SQL error numbers in order, then succeeds with the attempt number.
fn scripted(
    codes: &'static [i32],
    calls: &Arc<AtomicU32>,
) -> impl Fn() -> BoxFuture<'static, Result<u32, Failure>> {
    let calls = calls.clone();
    move || {
        let calls = calls.clone();
        Box::pin(async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            match codes.get(n as usize) {
                Some(&code) => Err(Failure::with_code(code, "sql error")),
                None => Ok(n + 1),
            }
        })
    }
}

fn assert_between(elapsed: Duration, low: Duration, high: Duration) {
    assert!(
        elapsed >= low && elapsed < high,
        "elapsed {:?} not in [{:?}, {:?})",
        elapsed,
        low,
        high
    );
}

#[tokio::test(start_paused = true)]
async fn test_varying_failures_do_not_open_circuit() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_circuit_breaker()
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let start = Instant::now();
    let result = executor
        .execute(scripted(&[40613, 40197, 40501, 49918], &calls))
        .await;

    assert_eq!(assert_ok!(result), 5);
    // 2 + 4 + 8 + 16
    assert_between(start.elapsed(), Duration::from_secs(30), Duration::from_secs(31));
    assert_eq!(executor.circuit_state(), Some(CircuitState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_same_failure_three_times_opens_circuit() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let start = Instant::now();
    let result = executor
        .execute(scripted(&[40613, 40613, 40613, 40613, 40613], &calls))
        .await;

    let error = assert_err!(result);
    assert!(error.is_circuit_open());
    assert_eq!(error.failure().and_then(Failure::code), Some(40613));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Two completed back-offs, no wait after the third failure.
    assert_between(start.elapsed(), Duration::from_secs(6), Duration::from_secs(7));
    assert_eq!(executor.circuit_state(), Some(CircuitState::Open));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let _ = executor.execute(scripted(&[40501; 3], &calls)).await;

    let start = Instant::now();
    let result = executor.execute(scripted(&[], &calls)).await;

    let error = assert_err!(result);
    match error {
        PolicyError::CircuitOpen { retry_after, cause } => {
            assert!(retry_after <= Duration::from_secs(30));
            assert!(cause.is_none());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_circuit_recovers_after_break() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let _ = executor.execute(scripted(&[40501; 3], &calls)).await;
    assert_eq!(executor.circuit_state(), Some(CircuitState::Open));

    tokio::time::advance(Duration::from_secs(30)).await;

    let trial = Arc::new(AtomicU32::new(0));
    let result = executor.execute(scripted(&[], &trial)).await;

    assert_eq!(assert_ok!(result), 1);
    assert_eq!(executor.circuit_state(), Some(CircuitState::Closed));
    let breaker = executor.chain().unwrap().circuit_breaker().cloned().unwrap();
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let _ = executor.execute(scripted(&[40501; 3], &calls)).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    let trial = Arc::new(AtomicU32::new(0));
    let result = executor.execute(scripted(&[40501; 6], &trial)).await;

    assert!(assert_err!(result).is_circuit_open());
    assert_eq!(trial.load(Ordering::SeqCst), 1);
    assert_eq!(executor.circuit_state(), Some(CircuitState::Open));
}

#[tokio::test(start_paused = true)]
async fn test_unclassified_failure_propagates_immediately() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor.execute(scripted(&[2627], &calls)).await;

    assert!(matches!(
        assert_err!(result),
        PolicyError::Unclassified { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_returns_last_failure() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_retry_config(RetryConfig {
            max_attempts: 3,
            ..Default::default()
        })
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor
        .execute(scripted(&[40613, 40197, 40501, 40501], &calls))
        .await;

    match assert_err!(result) {
        PolicyError::Transient { source, attempts } => {
            assert_eq!(source.code(), Some(40501));
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transaction_errors_retry_only_when_enabled() {
    let calls = Arc::new(AtomicU32::new(0));
    let plain = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .build()
        .unwrap();
    let result = plain.execute(scripted(&[40549], &calls)).await;
    assert!(matches!(assert_err!(result), PolicyError::Unclassified { .. }));

    let calls = Arc::new(AtomicU32::new(0));
    let transactional = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_transaction()
        .build()
        .unwrap();
    let result = transactional.execute(scripted(&[40549, 40550], &calls)).await;
    assert_eq!(assert_ok!(result), 3);
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_cancels_slow_attempt() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_overall_timeout()
        .with_overall_timeout_duration(Duration::from_secs(5))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let start = Instant::now();
    let result = executor
        .execute(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Failure>(())
            }
        })
        .await;

    assert!(matches!(
        assert_err!(result),
        PolicyError::Timeout {
            scope: TimeoutScope::Overall,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_between(start.elapsed(), Duration::from_secs(5), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_interrupts_retry_sequence() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_overall_timeout()
        .with_overall_timeout_duration(Duration::from_secs(10))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let start = Instant::now();
    let result = executor.execute(scripted(&[40613; 6], &calls)).await;

    assert!(assert_err!(result).is_timeout());
    // Attempts at 0s, 2s and 6s; the 8s wait is cut at 10s.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_between(start.elapsed(), Duration::from_secs(10), Duration::from_secs(11));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_per_attempt_timeout_is_retried() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_timeout_per_retry(Duration::from_secs(1))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let start = Instant::now();
    let result = executor
        .execute(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, Failure>("row")
            }
        })
        .await;

    assert_eq!(assert_ok!(result), "row");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s timeout + 2s wait + 1s timeout + 4s wait
    assert_between(start.elapsed(), Duration::from_secs(8), Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_on_exhaustion() {
    let fallbacks = Arc::new(AtomicU32::new(0));
    let counter = fallbacks.clone();
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_retry_config(RetryConfig {
            max_attempts: 2,
            ..Default::default()
        })
        .with_fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor.execute(scripted(&[40613; 5], &calls)).await;

    assert_eq!(assert_ok!(result), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_on_circuit_open() {
    let fallbacks = Arc::new(AtomicU32::new(0));
    let counter = fallbacks.clone();
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .with_fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    assert_ok!(executor.execute(scripted(&[40501; 6], &calls)).await);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);

    assert_ok!(executor.execute(scripted(&[], &calls)).await);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_on_timeout_reports_value_through_capture() {
    let cached = Arc::new(parking_lot::Mutex::new(None));
    let slot = cached.clone();
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_overall_timeout()
        .with_overall_timeout_duration(Duration::from_secs(1))
        .with_fallback(move || {
            let slot = slot.clone();
            async move {
                *slot.lock() = Some("cached row");
                Ok(())
            }
        })
        .build()
        .unwrap();

    let result = executor
        .execute(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Failure>("fresh row")
        })
        .await;

    assert_eq!(assert_ok!(result), "");
    assert_eq!(*cached.lock(), Some("cached row"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_fallback_surfaces() {
    let executor = PolicyBuilder::new()
        .use_async_executor()
        .with_transient_errors()
        .with_fallback(|| async { Err(Failure::new("cache miss")) })
        .build()
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let result = executor.execute(scripted(&[2627], &calls)).await;

    match assert_err!(result) {
        PolicyError::FallbackFailed { source } => assert_eq!(source.message(), "cache miss"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_builder_rejects_invalid_selections() {
    let none = PolicyBuilder::new().use_async_executor().build();
    assert_eq!(none.unwrap_err(), ConfigurationError::NoPolicies);

    let duplicated = PolicyBuilder::new()
        .use_async_executor()
        .with_default_policies()
        .with_transient_errors()
        .build();
    assert_eq!(duplicated.unwrap_err(), ConfigurationError::DuplicatedPolicies);

    let orphan_timeout = PolicyBuilder::new()
        .use_async_executor()
        .with_overall_timeout()
        .with_timeout_per_retry(Duration::from_secs(1))
        .build();
    let error = orphan_timeout.unwrap_err();
    assert_eq!(error, ConfigurationError::TimeoutPerRetryWithoutRetry);
    assert!(error.to_string().contains("retry"));
}
