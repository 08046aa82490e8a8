//! Time limits for a whole execution or a single attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::errors::PolicyError;

/// What a timeout policy bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// The whole execution, retries and waits included.
    Overall,
    /// One attempt of the operation.
    PerAttempt,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Overall => write!(f, "overall"),
            TimeoutScope::PerAttempt => write!(f, "per-attempt"),
        }
    }
}

/// Cancels the wrapped work once `duration` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
    scope: TimeoutScope,
}

impl TimeoutPolicy {
    /// Creates a timeout over the whole execution.
    pub fn overall(duration: Duration) -> Self {
        Self {
            duration,
            scope: TimeoutScope::Overall,
        }
    }

    /// Creates a timeout over each attempt.
    pub fn per_attempt(duration: Duration) -> Self {
        Self {
            duration,
            scope: TimeoutScope::PerAttempt,
        }
    }

    /// The configured limit.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// What the limit applies to.
    pub fn scope(&self) -> TimeoutScope {
        self.scope
    }

    /// Policy name used in chain descriptions.
    pub fn name(&self) -> &'static str {
        match self.scope {
            TimeoutScope::Overall => "overall-timeout",
            TimeoutScope::PerAttempt => "timeout-per-retry",
        }
    }

    /// Drives `future` to completion or drops it when the limit is reached.
    pub(crate) async fn run<F: Future>(&self, future: F) -> Result<F::Output, PolicyError> {
        match tokio::time::timeout(self.duration, future).await {
            Ok(output) => Ok(output),
            Err(_) => Err(self.elapsed()),
        }
    }

    /// The error reported when this limit is reached.
    pub(crate) fn elapsed(&self) -> PolicyError {
        tracing::warn!(
            scope = %self.scope,
            timeout_ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            "Timeout elapsed"
        );
        PolicyError::timeout(self.scope, self.duration)
    }
}
