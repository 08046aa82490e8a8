//! Executor for blocking operations.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{earliest, judge, record_overall_timeout, AttemptError, ChainSource, Step};
use crate::context::Context;
use crate::errors::{Failure, PolicyResult};
use crate::registry::PolicyRegistry;
use crate::resilience::{CircuitPermit, CircuitState, PolicyChain, TimeoutPolicy};

/// Runs blocking closures through a policy chain on the calling thread.
///
/// A running closure cannot be interrupted. Timeouts are enforced when the
/// attempt returns: a result produced after its deadline is discarded and
/// reported as a timeout. Closures that want to stop early should poll
/// [`Context::is_cancelled`].
///
/// Results must implement `Default`, which is what a fallback yields. Row
/// types without one can be returned as `Option<T>`.
#[derive(Debug, Clone)]
pub struct SyncPolicyExecutor {
    source: ChainSource,
}

impl SyncPolicyExecutor {
    pub(crate) fn new(source: ChainSource) -> Self {
        Self { source }
    }

    /// Runs `operation` through the chain.
    ///
    /// When a fallback fires, the result is `T::default()`.
    pub fn execute<T, F>(&self, operation: F) -> PolicyResult<T>
    where
        T: Default,
        F: Fn() -> Result<T, Failure>,
    {
        self.execute_with_context(|_| operation(), &Context::default())
    }

    /// Runs `operation` through the chain, handing it the call context.
    pub fn execute_with_context<T, F>(&self, operation: F, context: &Context) -> PolicyResult<T>
    where
        T: Default,
        F: Fn(&Context) -> Result<T, Failure>,
    {
        let chain = self.source.resolve()?;
        let span = tracing::debug_span!(
            "execute",
            chain = %chain.name(),
            operation = context.operation_key(),
            correlation_id = %context.correlation_id(),
        );
        let _entered = span.enter();

        let result = guarded(&chain, &operation, context);

        match (result, chain.fallback()) {
            (Err(error), Some(fallback)) => fallback.recover_blocking(error),
            (result, _) => result,
        }
    }

    /// The chain this executor runs. Resolved from the registry in shared mode.
    pub fn chain(&self) -> PolicyResult<Arc<PolicyChain>> {
        Ok(self.source.resolve()?)
    }

    /// Current circuit state, if the chain has a circuit breaker.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.source
            .resolve()
            .ok()
            .and_then(|chain| chain.circuit_breaker().map(|breaker| breaker.state()))
    }

    /// The registry, when built in shared mode.
    pub fn policy_registry(&self) -> Option<&PolicyRegistry> {
        self.source.registry()
    }
}

fn guarded<T, F>(chain: &PolicyChain, operation: &F, context: &Context) -> PolicyResult<T>
where
    F: Fn(&Context) -> Result<T, Failure>,
{
    let permit = match chain.circuit_breaker() {
        Some(breaker) => Some(breaker.admit()?),
        None => None,
    };

    let overall = chain
        .overall_timeout()
        .and_then(|timeout| Overall::start(*timeout));
    let result = attempts(chain, permit.as_ref(), operation, context, overall.as_ref());

    record_overall_timeout(chain, permit.as_ref(), &result);
    result
}

struct Overall {
    policy: TimeoutPolicy,
    deadline: Instant,
}

impl Overall {
    // A deadline past what `Instant` can represent never fires.
    fn start(policy: TimeoutPolicy) -> Option<Self> {
        Instant::now()
            .checked_add(policy.duration())
            .map(|deadline| Self { policy, deadline })
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

fn attempts<T, F>(
    chain: &PolicyChain,
    permit: Option<&CircuitPermit<'_>>,
    operation: &F,
    context: &Context,
    overall: Option<&Overall>,
) -> PolicyResult<T>
where
    F: Fn(&Context) -> Result<T, Failure>,
{
    let per_attempt = chain.timeout_per_attempt();
    let mut number = 1;

    loop {
        if number > 1 {
            if let Some(breaker) = chain.circuit_breaker() {
                breaker.check()?;
            }
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let attempt_deadline = per_attempt.and_then(|t| clock.checked_add(t.duration()));
        context.begin_attempt(
            number,
            earliest(attempt_deadline, overall.map(|o| o.deadline))
                .map(tokio::time::Instant::from_std),
        );

        let output = operation(context);

        if let Some(overall) = overall {
            if overall.remaining().is_zero() {
                return Err(overall.policy.elapsed());
            }
        }
        let result = match (per_attempt, attempt_deadline) {
            (Some(timeout), Some(deadline)) if Instant::now() >= deadline => {
                tracing::warn!(
                    attempt = number,
                    timeout_ms = u64::try_from(timeout.duration().as_millis()).unwrap_or(u64::MAX),
                    "Attempt exceeded its timeout, result discarded"
                );
                Err(AttemptError::TimedOut(timeout.duration()))
            }
            _ => output.map_err(AttemptError::Failed),
        };

        match judge(chain, permit, context, number, started_at, clock.elapsed(), result) {
            Step::Done(result) => return result,
            Step::RetryAfter(delay) => {
                if let Some(overall) = overall {
                    let remaining = overall.remaining();
                    if delay >= remaining {
                        std::thread::sleep(remaining);
                        return Err(overall.policy.elapsed());
                    }
                }
                std::thread::sleep(delay);
                number += 1;
            }
        }
    }
}
