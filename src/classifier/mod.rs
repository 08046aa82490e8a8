//! Failure classification.
//!
//! A classifier decides whether a [`Failure`] is transient, which is what
//! gates retries and what the circuit breaker counts. Two SQL classes ship
//! with the crate: throttling/availability errors and transaction errors.
//! When more than one classifier is enabled they are combined with OR.

use std::fmt;
use std::sync::Arc;

use crate::errors::Failure;

/// SQL error numbers treated as transient (throttling, failover, transport).
pub const TRANSIENT_ERROR_NUMBERS: &[i32] = &[
    20, 64, 233, 1205, 4060, 4221, 10053, 10054, 10060, 10928, 10929, 40143, 40197, 40501, 40540,
    40613, 42108, 42109, 49918, 49919, 49920,
];

/// SQL error numbers raised when a transaction is aborted by the server.
pub const TRANSACTION_ERROR_NUMBERS: &[i32] = &[40549, 40550];

/// Decides whether a failure is worth retrying.
pub trait ErrorClassifier: Send + Sync {
    /// Returns true if the failure is transient.
    fn is_transient(&self, failure: &Failure) -> bool;

    /// Short name used in logs and policy names.
    fn name(&self) -> &str;
}

/// Sub-type of a counted failure, used by the circuit breaker to tell
/// consecutive failures of the same kind apart from a mix of kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// A failure carrying a server error number.
    Code(i32),
    /// A failure without an error number.
    Uncoded,
    /// A timeout policy fired.
    Timeout,
}

impl FailureClass {
    /// Derives the class of an operation failure.
    pub fn of(failure: &Failure) -> Self {
        failure.code().map_or(FailureClass::Uncoded, FailureClass::Code)
    }
}

/// Matches SQL throttling and availability errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientErrorClassifier;

impl ErrorClassifier for TransientErrorClassifier {
    fn is_transient(&self, failure: &Failure) -> bool {
        failure
            .code()
            .is_some_and(|code| TRANSIENT_ERROR_NUMBERS.contains(&code))
    }

    fn name(&self) -> &str {
        "transient-errors"
    }
}

/// Matches SQL transaction errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionErrorClassifier;

impl ErrorClassifier for TransactionErrorClassifier {
    fn is_transient(&self, failure: &Failure) -> bool {
        failure
            .code()
            .is_some_and(|code| TRANSACTION_ERROR_NUMBERS.contains(&code))
    }

    fn name(&self) -> &str {
        "transaction-errors"
    }
}

/// Matches a fixed set of error numbers.
#[derive(Debug, Clone)]
pub struct ErrorCodeClassifier {
    name: String,
    codes: Vec<i32>,
}

impl ErrorCodeClassifier {
    /// Creates a classifier matching the given codes.
    pub fn new(name: impl Into<String>, codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            name: name.into(),
            codes: codes.into_iter().collect(),
        }
    }
}

impl ErrorClassifier for ErrorCodeClassifier {
    fn is_transient(&self, failure: &Failure) -> bool {
        failure.code().is_some_and(|code| self.codes.contains(&code))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// OR-combination of classifiers. Empty matches nothing.
#[derive(Clone, Default)]
pub struct AnyClassifier {
    classifiers: Vec<Arc<dyn ErrorClassifier>>,
    name: String,
}

impl AnyClassifier {
    /// Creates a combination of the given classifiers.
    pub fn new(classifiers: Vec<Arc<dyn ErrorClassifier>>) -> Self {
        let name = classifiers
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { classifiers, name }
    }

    /// Returns true if no classifier is enabled.
    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    /// Number of combined classifiers.
    pub fn len(&self) -> usize {
        self.classifiers.len()
    }
}

impl ErrorClassifier for AnyClassifier {
    fn is_transient(&self, failure: &Failure) -> bool {
        self.classifiers.iter().any(|c| c.is_transient(failure))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for AnyClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyClassifier")
            .field("name", &self.name)
            .finish()
    }
}
