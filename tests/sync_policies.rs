//! Blocking executor behavior, on a millisecond time unit.

use integrations_sql_resilience::{
    Backoff, CircuitBreakerConfig, CircuitState, Context, Failure, PolicyBuilder, PolicyError,
    RetryConfig, TimeoutScope,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn retry_ms(max_attempts: u32, unit_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff: Backoff::exponential(Duration::from_millis(unit_ms)),
    }
}

fn breaker_ms(break_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        break_duration: Duration::from_millis(break_ms),
        ..Default::default()
    }
}

/// Fails with the given SQL error numbers in order, then succeeds with the attempt number.
fn scripted<'a>(codes: &'a [i32], calls: &'a AtomicU32) -> impl Fn() -> Result<u32, Failure> + 'a {
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        match codes.get(n as usize) {
            Some(&code) => Err(Failure::with_code(code, "sql error")),
            None => Ok(n + 1),
        }
    }
}

#[test]
fn test_varying_failures_then_success() {
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_transient_errors()
        .with_circuit_breaker()
        .with_retry_config(retry_ms(5, 1))
        .build()
        .unwrap();
    let calls = AtomicU32::new(0);

    let start = Instant::now();
    let result = executor.execute(scripted(&[40613, 40197, 40501, 49918], &calls));

    assert_eq!(result.unwrap(), 5);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(executor.circuit_state(), Some(CircuitState::Closed));
}

#[test]
fn test_circuit_opens_then_fails_fast_then_recovers() {
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_transient_errors()
        .with_circuit_breaker()
        .with_retry_config(retry_ms(6, 1))
        .with_circuit_breaker_config(breaker_ms(1_000))
        .build()
        .unwrap();
    let calls = AtomicU32::new(0);

    let result = executor.execute(scripted(&[40501; 6], &calls));
    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let start = Instant::now();
    let result = executor.execute(scripted(&[], &calls));
    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() < Duration::from_millis(500));

    std::thread::sleep(Duration::from_millis(1_100));

    let trial = AtomicU32::new(0);
    assert_eq!(executor.execute(scripted(&[], &trial)).unwrap(), 1);
    assert_eq!(executor.circuit_state(), Some(CircuitState::Closed));
}

#[test]
fn test_overall_timeout_discards_late_result() {
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_transient_errors()
        .with_overall_timeout()
        .with_overall_timeout_duration(Duration::from_millis(50))
        .build()
        .unwrap();
    let calls = AtomicU32::new(0);

    let result = executor.execute(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        Ok(1)
    });

    assert!(matches!(
        result,
        Err(PolicyError::Timeout {
            scope: TimeoutScope::Overall,
            ..
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_overall_timeout_cuts_back_off_short() {
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_transient_errors()
        .with_retry_config(retry_ms(6, 25))
        .with_overall_timeout()
        .with_overall_timeout_duration(Duration::from_millis(150))
        .build()
        .unwrap();
    let calls = AtomicU32::new(0);

    let start = Instant::now();
    let result = executor.execute(scripted(&[40613; 6], &calls));

    assert!(result.unwrap_err().is_timeout());
    // Attempts at 0ms and 50ms; the 100ms wait would end past the deadline.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_millis(150));
    // Uncut, the remaining waits alone would take 100 + 200 + 400 + 800ms.
    assert!(start.elapsed() < Duration::from_millis(1_000));
}

#[test]
fn test_overall_timeout_counts_for_breaker() {
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_circuit_breaker()
        .with_circuit_breaker_config(CircuitBreakerConfig {
            failure_threshold: 1,
            ..breaker_ms(1000)
        })
        .with_overall_timeout()
        .with_overall_timeout_duration(Duration::from_millis(5))
        .build()
        .unwrap();

    let result = executor.execute(|| {
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    });

    assert!(result.unwrap_err().is_timeout());
    assert_eq!(executor.circuit_state(), Some(CircuitState::Open));
}

#[test]
fn test_fallback_runs_once_per_failed_call() {
    let fallbacks = Arc::new(AtomicU32::new(0));
    let counter = fallbacks.clone();
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_transient_errors()
        .with_retry_config(retry_ms(3, 1))
        .with_fallback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    let calls = AtomicU32::new(0);

    let result = executor.execute(scripted(&[40613; 5], &calls));

    assert_eq!(result.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_context_is_shared_across_attempts() {
    let executor = PolicyBuilder::new()
        .use_sync_executor()
        .with_transient_errors()
        .with_retry_config(retry_ms(4, 1))
        .build()
        .unwrap();
    let context = Context::new("orders.insert").with("tenant", "contoso");

    let result = executor.execute_with_context(
        |context| {
            let attempt = context.attempt();
            context.insert(format!("attempt-{}", attempt), attempt);
            if attempt < 3 {
                Err(Failure::with_code(40197, "service error"))
            } else {
                Ok(attempt)
            }
        },
        &context,
    );

    assert_eq!(result.unwrap(), 3);
    assert_eq!(context.get("attempt-1"), Some(1.into()));
    assert_eq!(context.get("attempt-2"), Some(2.into()));
    assert_eq!(context.get("tenant"), Some("contoso".into()));
}
