//! Executors running operations through a policy chain.
//!
//! Both executors share the per-attempt bookkeeping in this module:
//! classification, circuit breaker accounting and the retry decision. They
//! differ only in how they wait and how they enforce timeouts.

mod async_executor;
mod sync_executor;

pub use async_executor::AsyncPolicyExecutor;
pub use sync_executor::SyncPolicyExecutor;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::classifier::FailureClass;
use crate::context::Context;
use crate::errors::{ConfigurationError, Failure, PolicyError, PolicyResult};
use crate::registry::PolicyRegistry;
use crate::resilience::{AttemptOutcome, CircuitPermit, ExecutionAttempt, PolicyChain, TimeoutScope};

/// Where an executor finds its chain.
#[derive(Debug, Clone)]
pub(crate) enum ChainSource {
    /// A chain private to the executor.
    Owned(Arc<PolicyChain>),
    /// A chain looked up by name on every call.
    Shared {
        registry: PolicyRegistry,
        name: String,
    },
}

impl ChainSource {
    pub(crate) fn resolve(&self) -> Result<Arc<PolicyChain>, ConfigurationError> {
        match self {
            ChainSource::Owned(chain) => Ok(chain.clone()),
            ChainSource::Shared { registry, name } => {
                registry
                    .get(name)
                    .ok_or_else(|| ConfigurationError::UnknownPolicy { name: name.clone() })
            }
        }
    }

    pub(crate) fn registry(&self) -> Option<&PolicyRegistry> {
        match self {
            ChainSource::Owned(_) => None,
            ChainSource::Shared { registry, .. } => Some(registry),
        }
    }
}

/// How a single attempt ended before classification.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Failed(Failure),
    TimedOut(Duration),
}

/// What the executor does after an attempt.
#[derive(Debug)]
pub(crate) enum Step<T> {
    Done(PolicyResult<T>),
    RetryAfter(Duration),
}

/// Classifies an attempt's result, records it with the circuit breaker under
/// the call's `permit` and decides whether to retry.
pub(crate) fn judge<T>(
    chain: &PolicyChain,
    permit: Option<&CircuitPermit<'_>>,
    context: &Context,
    number: u32,
    started_at: DateTime<Utc>,
    elapsed: Duration,
    result: Result<T, AttemptError>,
) -> Step<T> {
    let classified = match result {
        Ok(value) => Ok(value),
        Err(AttemptError::Failed(failure)) if chain.classifier().is_transient(&failure) => {
            Err(PolicyError::Transient {
                source: failure,
                attempts: number,
            })
        }
        Err(AttemptError::Failed(failure)) => Err(PolicyError::Unclassified { source: failure }),
        Err(AttemptError::TimedOut(duration)) => {
            Err(PolicyError::timeout(TimeoutScope::PerAttempt, duration))
        }
    };

    let attempt = ExecutionAttempt {
        number,
        started_at,
        elapsed,
        outcome: AttemptOutcome::of(&classified),
    };
    tracing::debug!(
        operation = context.operation_key(),
        correlation_id = %context.correlation_id(),
        attempt = number,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        outcome = ?attempt.outcome,
        "Attempt finished"
    );

    if let (Some(breaker), Some(permit)) = (chain.circuit_breaker(), permit) {
        let counted = match &classified {
            Ok(_) => {
                breaker.record_success(permit);
                None
            }
            Err(PolicyError::Transient { source, .. }) => Some(FailureClass::of(source)),
            Err(PolicyError::Timeout { .. }) => Some(FailureClass::Timeout),
            Err(_) => {
                breaker.record_unmatched();
                None
            }
        };
        if let Some(class) = counted {
            if breaker.record_failure(permit, class) {
                let cause = classified.err().map(Box::new);
                return Step::Done(Err(PolicyError::CircuitOpen {
                    retry_after: breaker.config().break_duration,
                    cause,
                }));
            }
        }
    }

    let error = match classified {
        Ok(value) => return Step::Done(Ok(value)),
        Err(error) => error,
    };

    match chain
        .retry()
        .and_then(|retry| retry.next_delay(&attempt, &error, context.operation_key()))
    {
        Some(delay) => Step::RetryAfter(delay),
        None => {
            if let PolicyError::Transient { .. } = error {
                if chain.retry().is_some() {
                    tracing::error!(
                        operation = context.operation_key(),
                        attempts = number,
                        error = %error,
                        "Retries exhausted"
                    );
                }
            }
            Step::Done(Err(error))
        }
    }
}

/// Records an overall timeout with the circuit breaker.
pub(crate) fn record_overall_timeout<T>(
    chain: &PolicyChain,
    permit: Option<&CircuitPermit<'_>>,
    result: &PolicyResult<T>,
) {
    if let (
        Some(breaker),
        Some(permit),
        Err(PolicyError::Timeout {
            scope: TimeoutScope::Overall,
            ..
        }),
    ) = (chain.circuit_breaker(), permit, result)
    {
        breaker.record_failure(permit, FailureClass::Timeout);
    }
}

/// The earlier of two optional deadlines.
pub(crate) fn earliest<I: Ord>(a: Option<I>, b: Option<I>) -> Option<I> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
