//! Ordered composition of policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{CircuitBreaker, FallbackPolicy, RetryPolicy, TimeoutPolicy, TimeoutScope};
use crate::classifier::{AnyClassifier, ErrorClassifier, TransactionErrorClassifier, TransientErrorClassifier};
use crate::config::PolicyOptions;
use crate::errors::ConfigurationError;

/// One layer of a chain.
#[derive(Debug, Clone)]
pub enum Policy {
    /// Recovers from any terminal failure.
    Fallback(FallbackPolicy),
    /// Rejects calls while the circuit is open.
    CircuitBreaker(Arc<CircuitBreaker>),
    /// Bounds the execution or one attempt.
    Timeout(TimeoutPolicy),
    /// Re-runs transient failures.
    Retry(RetryPolicy),
}

impl Policy {
    /// Short policy name.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Fallback(_) => "fallback",
            Policy::CircuitBreaker(_) => "circuit-breaker",
            Policy::Timeout(timeout) => timeout.name(),
            Policy::Retry(_) => "retry",
        }
    }
}

/// A validated stack of policies, outermost first.
///
/// The order is fixed regardless of the order policies were selected in:
/// fallback, circuit breaker, overall timeout, retry, timeout per attempt.
/// The circuit breaker state lives here, so every executor resolving the
/// same chain shares it.
#[derive(Clone)]
pub struct PolicyChain {
    name: String,
    policies: Vec<Policy>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl PolicyChain {
    /// Validates the options and builds the chain.
    pub fn from_options(options: &PolicyOptions) -> Result<Self, ConfigurationError> {
        validate(options)?;

        let classifier = classifier_for(options);
        let mut policies = Vec::new();

        if let Some(handler) = &options.fallback {
            policies.push(Policy::Fallback(FallbackPolicy::new(handler.clone())));
        }
        if options.breaks_circuit() {
            let mut breaker = CircuitBreaker::new(options.breaker.clone(), classifier.clone());
            if let Some(hook) = &options.breaker_hook {
                breaker = breaker.with_hook(hook.clone());
            }
            policies.push(Policy::CircuitBreaker(Arc::new(breaker)));
        }
        if options.times_out_overall() {
            policies.push(Policy::Timeout(TimeoutPolicy::overall(
                options.effective_overall_timeout(),
            )));
        }
        if options.retries() {
            let mut retry = RetryPolicy::new(options.retry.clone(), classifier.clone());
            if let Some(hook) = &options.retry_hook {
                retry = retry.with_hook(hook.clone());
            }
            policies.push(Policy::Retry(retry));
        }
        if let Some(duration) = options.timeout_per_retry {
            policies.push(Policy::Timeout(TimeoutPolicy::per_attempt(duration)));
        }

        let name = options
            .policy_name
            .clone()
            .unwrap_or_else(|| options.policy_names().join("_"));

        let chain = Self {
            name,
            policies,
            classifier,
        };
        tracing::debug!(name = %chain.name, policies = %chain.describe(), "Policy chain built");
        Ok(chain)
    }

    /// The chain name; the registry key for shared chains.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The policies, outermost first.
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// The combined classifier.
    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    /// Policy names joined outermost first, e.g. `circuit-breaker -> retry`.
    pub fn describe(&self) -> String {
        self.policies
            .iter()
            .map(Policy::name)
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// The fallback policy, if configured.
    pub fn fallback(&self) -> Option<&FallbackPolicy> {
        self.policies.iter().find_map(|policy| match policy {
            Policy::Fallback(fallback) => Some(fallback),
            _ => None,
        })
    }

    /// The circuit breaker, if configured.
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.policies.iter().find_map(|policy| match policy {
            Policy::CircuitBreaker(breaker) => Some(breaker),
            _ => None,
        })
    }

    /// The retry policy, if configured.
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.policies.iter().find_map(|policy| match policy {
            Policy::Retry(retry) => Some(retry),
            _ => None,
        })
    }

    /// The overall timeout, if configured.
    pub fn overall_timeout(&self) -> Option<&TimeoutPolicy> {
        self.timeout(TimeoutScope::Overall)
    }

    /// The per-attempt timeout, if configured.
    pub fn timeout_per_attempt(&self) -> Option<&TimeoutPolicy> {
        self.timeout(TimeoutScope::PerAttempt)
    }

    fn timeout(&self, scope: TimeoutScope) -> Option<&TimeoutPolicy> {
        self.policies.iter().find_map(|policy| match policy {
            Policy::Timeout(timeout) if timeout.scope() == scope => Some(timeout),
            _ => None,
        })
    }
}

impl fmt::Debug for PolicyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyChain")
            .field("name", &self.name)
            .field("policies", &self.describe())
            .field("classifier", &self.classifier.name())
            .finish()
    }
}

fn validate(options: &PolicyOptions) -> Result<(), ConfigurationError> {
    let selected = options.default_policies
        || options.transient_errors
        || options.circuit_breaker
        || options.overall_timeout
        || options.timeout_per_retry.is_some()
        || options.fallback.is_some();
    if !selected {
        return Err(ConfigurationError::NoPolicies);
    }

    if options.default_policies
        && (options.transient_errors || options.circuit_breaker || options.overall_timeout)
    {
        return Err(ConfigurationError::DuplicatedPolicies);
    }

    if options.timeout_per_retry.is_some() && !options.retries() {
        return Err(ConfigurationError::TimeoutPerRetryWithoutRetry);
    }

    if options.retries() && options.retry.max_attempts == 0 {
        return Err(invalid("max_attempts", "must be at least 1"));
    }
    if options.breaks_circuit() {
        if options.breaker.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if options.breaker.break_duration.is_zero() {
            return Err(invalid("break_duration", "must be greater than zero"));
        }
    }
    if options.timeout_per_retry == Some(Duration::ZERO) {
        return Err(invalid("timeout_per_retry", "must be greater than zero"));
    }
    if options.times_out_overall() && options.overall_timeout_duration == Some(Duration::ZERO) {
        return Err(invalid("overall_timeout", "must be greater than zero"));
    }

    Ok(())
}

fn invalid(name: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidParameter {
        name,
        reason: reason.to_string(),
    }
}

fn classifier_for(options: &PolicyOptions) -> Arc<dyn ErrorClassifier> {
    let mut classifiers: Vec<Arc<dyn ErrorClassifier>> = Vec::new();
    if options.classifies_throttling() {
        classifiers.push(Arc::new(TransientErrorClassifier));
    }
    if options.transaction_errors {
        classifiers.push(Arc::new(TransactionErrorClassifier));
    }
    classifiers.extend(options.classifiers.iter().cloned());
    Arc::new(AnyClassifier::new(classifiers))
}
