//! Configuration for policy chains.
//!
//! [`PolicyOptions`] is the explicit configuration value the builder
//! accumulates. It can also be read from JSON or the environment and turned
//! into a validated chain with [`PolicyChain::from_options`].
//!
//! [`PolicyChain::from_options`]: crate::resilience::PolicyChain::from_options

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::classifier::ErrorClassifier;
use crate::errors::ConfigurationError;
use crate::resilience::{Backoff, CircuitBreakerHook, FallbackHandler, RetryHook};

/// Default number of attempts (the first call plus five retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Default back-off time unit; the n-th retry waits `2^n` units.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Default number of consecutive failures that opens the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default time the circuit stays open.
pub const DEFAULT_BREAK_DURATION: Duration = Duration::from_secs(30);

/// Extra time the default overall timeout grants on top of all back-off waits.
pub const DEFAULT_OVERALL_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Retry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive matching failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open.
    #[serde(with = "duration_ms", rename = "break_duration_ms")]
    pub break_duration: Duration,
    /// Whether a failure of a different class restarts the consecutive count.
    pub count_per_failure_class: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            break_duration: DEFAULT_BREAK_DURATION,
            count_per_failure_class: true,
        }
    }
}

/// Everything a policy chain is built from.
///
/// Selecting policies only flips fields here; nothing is validated until
/// the chain is built.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOptions {
    /// Retry + circuit breaker + overall timeout, pre-composed.
    pub default_policies: bool,
    /// Retry on transient (throttling-class) errors.
    pub transient_errors: bool,
    /// Circuit breaker.
    pub circuit_breaker: bool,
    /// Timeout over the whole retry sequence.
    pub overall_timeout: bool,
    /// Timeout over each single attempt.
    #[serde(with = "option_duration_ms", rename = "timeout_per_retry_ms")]
    pub timeout_per_retry: Option<Duration>,
    /// Also treat transaction-class errors as transient.
    pub transaction_errors: bool,
    /// Treat throttling-class errors as transient. When unset, the class is
    /// on for chains that retry, and for any chain that enables no other
    /// built-in class.
    pub throttling_errors: Option<bool>,
    /// Retry parameters.
    pub retry: RetryConfig,
    /// Circuit breaker parameters.
    pub breaker: CircuitBreakerConfig,
    /// Overrides the derived overall timeout.
    #[serde(with = "option_duration_ms", rename = "overall_timeout_ms")]
    pub overall_timeout_duration: Option<Duration>,
    /// Registry key override for shared chains.
    pub policy_name: Option<String>,
    /// Handler invoked when the chain ultimately fails.
    #[serde(skip)]
    pub fallback: Option<FallbackHandler>,
    /// Additional classifiers, OR-combined with the built-in ones.
    #[serde(skip)]
    pub classifiers: Vec<Arc<dyn ErrorClassifier>>,
    /// Observer for scheduled retries.
    #[serde(skip)]
    pub retry_hook: Option<Arc<dyn RetryHook>>,
    /// Observer for circuit state changes.
    #[serde(skip)]
    pub breaker_hook: Option<Arc<dyn CircuitBreakerHook>>,
}

impl PolicyOptions {
    /// Creates empty options; no policy is selected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Creates options with tuning parameters read from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SQL_RESILIENCE_MAX_ATTEMPTS`: maximum attempts per execution
    /// - `SQL_RESILIENCE_BACKOFF_UNIT_MS`: exponential back-off unit
    /// - `SQL_RESILIENCE_FAILURE_THRESHOLD`: consecutive failures to open the circuit
    /// - `SQL_RESILIENCE_BREAK_DURATION_SECS`: how long the circuit stays open
    /// - `SQL_RESILIENCE_OVERALL_TIMEOUT_SECS`: overall timeout override
    ///
    /// Policy selection is left to the builder.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let mut options = Self::default();

        if let Some(attempts) = env_number::<u32>("SQL_RESILIENCE_MAX_ATTEMPTS")? {
            options.retry.max_attempts = attempts;
        }
        if let Some(unit) = env_number::<u64>("SQL_RESILIENCE_BACKOFF_UNIT_MS")? {
            options.retry.backoff = Backoff::exponential(Duration::from_millis(unit));
        }
        if let Some(threshold) = env_number::<u32>("SQL_RESILIENCE_FAILURE_THRESHOLD")? {
            options.breaker.failure_threshold = threshold;
        }
        if let Some(secs) = env_number::<u64>("SQL_RESILIENCE_BREAK_DURATION_SECS")? {
            options.breaker.break_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number::<u64>("SQL_RESILIENCE_OVERALL_TIMEOUT_SECS")? {
            options.overall_timeout_duration = Some(Duration::from_secs(secs));
        }

        Ok(options)
    }

    /// Returns true if a retry policy is selected.
    pub fn retries(&self) -> bool {
        self.default_policies || self.transient_errors
    }

    /// Returns true if a circuit breaker is selected.
    pub fn breaks_circuit(&self) -> bool {
        self.default_policies || self.circuit_breaker
    }

    /// Returns true if an overall timeout is selected.
    pub fn times_out_overall(&self) -> bool {
        self.default_policies || self.overall_timeout
    }

    /// Returns true if throttling-class errors are classified as transient.
    pub fn classifies_throttling(&self) -> bool {
        self.throttling_errors
            .unwrap_or(self.retries() || !self.transaction_errors)
    }

    /// The overall timeout: the override, or every back-off wait of the
    /// retry budget plus a grace period.
    pub fn effective_overall_timeout(&self) -> Duration {
        self.overall_timeout_duration.unwrap_or_else(|| {
            let waits = if self.retries() {
                self.retry.backoff.total_for(self.retry.max_attempts)
            } else {
                Duration::ZERO
            };
            waits.saturating_add(DEFAULT_OVERALL_TIMEOUT_GRACE)
        })
    }

    /// Names of the selected policies, outermost first.
    pub fn policy_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.fallback.is_some() {
            names.push("fallback");
        }
        if self.breaks_circuit() {
            names.push("circuit-breaker");
        }
        if self.times_out_overall() {
            names.push("overall-timeout");
        }
        if self.retries() {
            names.push("retry");
        }
        if self.timeout_per_retry.is_some() {
            names.push("timeout-per-retry");
        }
        if self.transaction_errors {
            names.push("transaction");
        }
        names
    }
}

impl fmt::Debug for PolicyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyOptions")
            .field("default_policies", &self.default_policies)
            .field("transient_errors", &self.transient_errors)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("overall_timeout", &self.overall_timeout)
            .field("timeout_per_retry", &self.timeout_per_retry)
            .field("transaction_errors", &self.transaction_errors)
            .field("throttling_errors", &self.throttling_errors)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("overall_timeout_duration", &self.overall_timeout_duration)
            .field("policy_name", &self.policy_name)
            .field("fallback", &self.fallback.is_some())
            .field("classifiers", &self.classifiers.len())
            .finish()
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigurationError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigurationError::Source {
                message: format!("{} must be a non-negative integer, got '{}'", key, raw),
            }),
        Err(_) => Ok(None),
    }
}

/// Serde helper storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde helper storing an `Option<Duration>` as whole milliseconds.
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
