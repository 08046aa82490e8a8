//! Bounded retries with back-off.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{Backoff, TimeoutScope};
use crate::classifier::ErrorClassifier;
use crate::config::RetryConfig;
use crate::errors::PolicyError;

/// Record of one try of the wrapped operation.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    /// Attempt number (1-indexed).
    pub number: u32,
    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,
    /// How long the attempt ran.
    pub elapsed: Duration,
    /// How it ended.
    pub outcome: AttemptOutcome,
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The operation succeeded.
    Succeeded,
    /// The operation returned a failure.
    Failed {
        /// Whether the classifiers matched it.
        transient: bool,
        /// The failure message.
        message: String,
    },
    /// The per-attempt timeout fired.
    TimedOut {
        /// The configured timeout.
        after: Duration,
    },
}

impl AttemptOutcome {
    pub(crate) fn of<T>(result: &Result<T, PolicyError>) -> Self {
        match result {
            Ok(_) => AttemptOutcome::Succeeded,
            Err(PolicyError::Timeout { duration, .. }) => AttemptOutcome::TimedOut { after: *duration },
            Err(error) => AttemptOutcome::Failed {
                transient: matches!(error, PolicyError::Transient { .. }),
                message: error
                    .failure()
                    .map_or_else(|| error.to_string(), ToString::to_string),
            },
        }
    }
}

/// Context passed to retry hooks.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// The attempt that just failed.
    pub attempt: ExecutionAttempt,
    /// The delay the back-off computed before the next attempt.
    pub delay: Duration,
    /// The operation being retried.
    pub operation: String,
}

/// Decision returned by retry hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Use default retry behavior.
    Default,
    /// Retry with a custom delay.
    Retry(Duration),
    /// Abort and return the error.
    Abort,
}

/// Hook for custom retry behavior.
#[cfg_attr(test, mockall::automock)]
pub trait RetryHook: Send + Sync {
    /// Called before waiting for the next attempt.
    fn on_retry(&self, context: &RetryContext) -> RetryDecision;
}

/// Retries transient failures up to `max_attempts` times.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    classifier: Arc<dyn ErrorClassifier>,
    hook: Option<Arc<dyn RetryHook>>,
}

impl RetryPolicy {
    /// Creates a retry policy gated by the given classifier.
    pub fn new(config: RetryConfig, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff,
            classifier,
            hook: None,
        }
    }

    /// Sets a retry hook.
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The back-off strategy.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// The classifier gating retries.
    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    /// Returns true if the error may be retried. Per-attempt timeouts always are.
    pub fn is_retriable(&self, error: &PolicyError) -> bool {
        match error {
            PolicyError::Transient { source, .. } => self.classifier.is_transient(source),
            PolicyError::Timeout { scope, .. } => *scope == TimeoutScope::PerAttempt,
            _ => false,
        }
    }

    /// Computes the wait before the next attempt, or `None` to stop retrying.
    pub(crate) fn next_delay(
        &self,
        attempt: &ExecutionAttempt,
        error: &PolicyError,
        operation: &str,
    ) -> Option<Duration> {
        if !self.is_retriable(error) || attempt.number >= self.max_attempts {
            return None;
        }

        let delay = self.backoff.delay_for(attempt.number);
        let delay = match &self.hook {
            Some(hook) => {
                let context = RetryContext {
                    attempt: attempt.clone(),
                    delay,
                    operation: operation.to_string(),
                };
                match hook.on_retry(&context) {
                    RetryDecision::Default => delay,
                    RetryDecision::Retry(custom) => custom,
                    RetryDecision::Abort => {
                        tracing::debug!(attempt = attempt.number, "Retry aborted by hook");
                        return None;
                    }
                }
            }
            None => delay,
        };

        tracing::warn!(
            operation = operation,
            attempt = attempt.number,
            max_attempts = self.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after transient failure"
        );
        Some(delay)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("classifier", &self.classifier.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TransientErrorClassifier;
    use crate::errors::Failure;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig {
                max_attempts,
                backoff: Backoff::exponential(Duration::from_millis(10)),
            },
            Arc::new(TransientErrorClassifier),
        )
    }

    fn attempt(number: u32) -> ExecutionAttempt {
        ExecutionAttempt {
            number,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(1),
            outcome: AttemptOutcome::Failed {
                transient: true,
                message: "busy".to_string(),
            },
        }
    }

    fn transient() -> PolicyError {
        PolicyError::Transient {
            source: Failure::with_code(40501, "service busy"),
            attempts: 1,
        }
    }

    #[test]
    fn test_delay_follows_backoff() {
        let retry = policy(5);
        assert_eq!(
            retry.next_delay(&attempt(1), &transient(), "op"),
            Some(Duration::from_millis(20))
        );
        assert_eq!(
            retry.next_delay(&attempt(3), &transient(), "op"),
            Some(Duration::from_millis(80))
        );
    }

    #[test]
    fn test_stops_when_budget_spent() {
        let retry = policy(3);
        assert!(retry.next_delay(&attempt(2), &transient(), "op").is_some());
        assert!(retry.next_delay(&attempt(3), &transient(), "op").is_none());
    }

    #[test]
    fn test_only_transient_and_per_attempt_timeouts_retry() {
        let retry = policy(5);

        let unclassified = PolicyError::Unclassified {
            source: Failure::with_code(2627, "duplicate key"),
        };
        let per_attempt = PolicyError::timeout(TimeoutScope::PerAttempt, Duration::from_millis(5));
        let overall = PolicyError::timeout(TimeoutScope::Overall, Duration::from_millis(5));
        let open = PolicyError::CircuitOpen {
            retry_after: Duration::from_secs(1),
            cause: None,
        };

        assert!(!retry.is_retriable(&unclassified));
        assert!(retry.is_retriable(&per_attempt));
        assert!(!retry.is_retriable(&overall));
        assert!(!retry.is_retriable(&open));
    }

    #[test]
    fn test_hook_overrides_delay() {
        let mut hook = MockRetryHook::new();
        hook.expect_on_retry()
            .withf(|context| context.attempt.number == 1 && context.operation == "orders.load")
            .times(1)
            .return_const(RetryDecision::Retry(Duration::from_millis(1)));

        let retry = policy(5).with_hook(Arc::new(hook));
        assert_eq!(
            retry.next_delay(&attempt(1), &transient(), "orders.load"),
            Some(Duration::from_millis(1))
        );
    }

    #[test]
    fn test_hook_can_abort() {
        let mut hook = MockRetryHook::new();
        hook.expect_on_retry().return_const(RetryDecision::Abort);

        let retry = policy(5).with_hook(Arc::new(hook));
        assert!(retry.next_delay(&attempt(1), &transient(), "op").is_none());
    }

    #[test]
    fn test_attempt_outcome_of() {
        let ok: Result<(), PolicyError> = Ok(());
        assert_eq!(AttemptOutcome::of(&ok), AttemptOutcome::Succeeded);

        let failed: Result<(), PolicyError> = Err(transient());
        assert_eq!(
            AttemptOutcome::of(&failed),
            AttemptOutcome::Failed {
                transient: true,
                message: "[40501] service busy".to_string()
            }
        );
    }
}
