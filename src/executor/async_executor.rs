//! Executor for asynchronous operations.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;

use super::{earliest, judge, record_overall_timeout, AttemptError, ChainSource, Step};
use crate::context::Context;
use crate::errors::{Failure, PolicyResult};
use crate::registry::PolicyRegistry;
use crate::resilience::{CircuitPermit, CircuitState, PolicyChain};

/// Runs futures through a policy chain.
///
/// Timeouts drop the in-flight future, so an operation that is cancelled
/// never produces a result the caller can observe. Cloning is cheap; clones
/// share circuit breaker state.
///
/// Results must implement `Default`, which is what a fallback yields. Row
/// types without one can be returned as `Option<T>`.
#[derive(Debug, Clone)]
pub struct AsyncPolicyExecutor {
    source: ChainSource,
}

impl AsyncPolicyExecutor {
    pub(crate) fn new(source: ChainSource) -> Self {
        Self { source }
    }

    /// Runs `operation` through the chain.
    ///
    /// `operation` is invoked once per attempt. When a fallback fires, the
    /// result is `T::default()`.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> PolicyResult<T>
    where
        T: Default,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        self.execute_with_context(|_| operation(), Context::default())
            .await
    }

    /// Runs `operation` through the chain, handing it the call context.
    pub async fn execute_with_context<T, F, Fut>(
        &self,
        operation: F,
        context: Context,
    ) -> PolicyResult<T>
    where
        T: Default,
        F: Fn(Context) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let chain = self.source.resolve()?;
        let span = tracing::debug_span!(
            "execute",
            chain = %chain.name(),
            operation = context.operation_key(),
            correlation_id = %context.correlation_id(),
        );

        async {
            let result = guarded(&chain, &operation, &context).await;

            match (result, chain.fallback()) {
                (Err(error), Some(fallback)) => fallback.recover(error).await,
                (result, _) => result,
            }
        }
        .instrument(span)
        .await
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

async fn guarded<T, F, Fut>(chain: &PolicyChain, operation: &F, context: &Context) -> PolicyResult<T>
where
    F: Fn(Context) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let permit = match chain.circuit_breaker() {
        Some(breaker) => Some(breaker.admit()?),
        None => None,
    };

    let result = match chain.overall_timeout() {
        Some(timeout) => {
            let deadline = Instant::now().checked_add(timeout.duration());
            timeout
                .run(attempts(chain, permit.as_ref(), operation, context, deadline))
                .await
                .and_then(|result| result)
        }
        None => attempts(chain, permit.as_ref(), operation, context, None).await,
    };

    record_overall_timeout(chain, permit.as_ref(), &result);
    result
}

async fn attempts<T, F, Fut>(
    chain: &PolicyChain,
    permit: Option<&CircuitPermit<'_>>,
    operation: &F,
    context: &Context,
    overall_deadline: Option<Instant>,
) -> PolicyResult<T>
where
    F: Fn(Context) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let per_attempt = chain.timeout_per_attempt();
    let mut number = 1;

    loop {
        if number > 1 {
            if let Some(breaker) = chain.circuit_breaker() {
                breaker.check()?;
            }
        }

        let attempt_deadline = per_attempt.and_then(|t| Instant::now().checked_add(t.duration()));
        context.begin_attempt(number, earliest(attempt_deadline, overall_deadline));

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = match per_attempt {
            Some(timeout) => match tokio::time::timeout(timeout.duration(), operation(context.clone())).await {
                Ok(output) => output.map_err(AttemptError::Failed),
                Err(_) => Err(AttemptError::TimedOut(timeout.duration())),
            },
            None => operation(context.clone()).await.map_err(AttemptError::Failed),
        };

        match judge(chain, permit, context, number, started_at, clock.elapsed(), result) {
            Step::Done(result) => return result,
            Step::RetryAfter(delay) => {
                tokio::time::sleep(delay).await;
                number += 1;
            }
        }
    }
}
