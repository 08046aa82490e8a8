//! Error types for the resilience policies.
//!
//! Two channels exist: [`ConfigurationError`] is returned while a policy chain
//! is being built, [`PolicyError`] is returned when an operation executed
//! through a chain ultimately fails. Caller operations report their own
//! failures as [`Failure`] values.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::TimeoutScope;

/// Result type alias for executions run through a policy chain.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// An opaque failure produced by a caller-supplied operation.
///
/// The optional `code` carries the server error number (for SQL Server, the
/// `SqlError.Number`) and is what the bundled classifiers match on.
#[derive(Debug)]
pub struct Failure {
    code: Option<i32>,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Failure {
    /// Creates a failure without an error code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a failure carrying a server error number.
    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying driver error.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the server error number, if any.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Builder misuse detected before any execution happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No policy was selected.
    #[error("There are no policies to execute.")]
    NoPolicies,

    /// The default bundle was combined with one of the policies it already contains.
    #[error(
        "There are duplicated policies. When you use the default policies, you can't use \
         transient errors, circuit breaker or overall timeout at the same time, because those \
         policies are already included."
    )]
    DuplicatedPolicies,

    /// A per-attempt timeout was requested without a retry policy.
    #[error(
        "You're trying to use a timeout per retry but you don't have a retry policy configured."
    )]
    TimeoutPerRetryWithoutRetry,

    /// A policy parameter is out of range.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// The offending parameter.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A shared executor could not find its chain in the registry.
    #[error("No policy chain registered under '{name}'")]
    UnknownPolicy {
        /// The registry key that was looked up.
        name: String,
    },

    /// Configuration could not be read from JSON or the environment.
    #[error("Invalid configuration source: {message}")]
    Source {
        /// Error message.
        message: String,
    },
}

impl From<serde_json::Error> for ConfigurationError {
    fn from(err: serde_json::Error) -> Self {
        ConfigurationError::Source {
            message: err.to_string(),
        }
    }
}

/// Terminal failure of an execution run through a policy chain.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The circuit breaker is open and the operation was not invoked.
    #[error("The circuit is now open and is not allowing calls.")]
    CircuitOpen {
        /// Time left until the breaker admits a trial call.
        retry_after: Duration,
        /// The failure that tripped the breaker, when this call tripped it.
        #[source]
        cause: Option<Box<PolicyError>>,
    },

    /// A timeout policy fired.
    #[error("The operation did not complete within the {scope} timeout of {duration:?}")]
    Timeout {
        /// Which timeout fired.
        scope: TimeoutScope,
        /// The configured duration.
        duration: Duration,
    },

    /// A failure matched by the active classifiers; retries, if any, were exhausted.
    #[error("Transient failure after {attempts} attempt(s): {source}")]
    Transient {
        /// The last failure.
        source: Failure,
        /// How many attempts were made.
        attempts: u32,
    },

    /// A failure not matched by any classifier; never retried.
    #[error("Operation failed: {source}")]
    Unclassified {
        /// The failure returned by the operation.
        source: Failure,
    },

    /// The fallback handler itself failed.
    #[error("Fallback failed: {source}")]
    FallbackFailed {
        /// The failure returned by the fallback handler.
        source: Failure,
    },

    /// The chain could not be resolved at execution time.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl PolicyError {
    /// Returns true if this error was raised by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PolicyError::CircuitOpen { .. })
    }

    /// Returns true if this error was raised by a timeout policy.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PolicyError::Timeout { .. })
    }

    /// Returns the operation failure carried by this error, if any.
    ///
    /// For an open circuit this is the failure that tripped it.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            PolicyError::Transient { source, .. }
            | PolicyError::Unclassified { source }
            | PolicyError::FallbackFailed { source } => Some(source),
            PolicyError::CircuitOpen { cause, .. } => cause.as_deref().and_then(Self::failure),
            PolicyError::Timeout { .. } | PolicyError::Configuration(_) => None,
        }
    }

    pub(crate) fn timeout(scope: TimeoutScope, duration: Duration) -> Self {
        PolicyError::Timeout { scope, duration }
    }
}
