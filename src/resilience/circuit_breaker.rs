//! Circuit breaker pattern implementation.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::classifier::{ErrorClassifier, FailureClass};
use crate::config::CircuitBreakerConfig;
use crate::errors::PolicyError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are admitted.
    Closed,
    /// Calls are rejected until the break duration elapses.
    Open,
    /// A single trial call is admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Hook for circuit breaker state changes.
#[cfg_attr(test, mockall::automock)]
pub trait CircuitBreakerHook: Send + Sync {
    /// Called when the circuit state changes.
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState);
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_class: Option<FailureClass>,
    opened_at: Option<Instant>,
    trial: Option<u64>,
    generation: u64,
}

/// Circuit breaker shared by every execution of a chain.
///
/// All transitions happen under one lock, so concurrent callers observe a
/// single linear history of states.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    classifier: Arc<dyn ErrorClassifier>,
    inner: Mutex<BreakerState>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
}

/// Admission granted by [`CircuitBreaker::admit`].
///
/// A half-open trial slot is released when the permit is dropped without the
/// outcome having moved the breaker out of half-open.
#[must_use]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl CircuitPermit<'_> {
    /// Returns true if this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial {
            let mut inner = self.breaker.inner.lock();
            if inner.trial == Some(generation) {
                inner.trial = None;
            }
        }
    }
}

type Transition = Option<(CircuitState, CircuitState)>;

impl CircuitBreaker {
    /// Creates a new circuit breaker counting failures the classifier matches.
    pub fn new(config: CircuitBreakerConfig, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            config,
            classifier,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_class: None,
                opened_at: None,
                trial: None,
                generation: 0,
            }),
            hook: None,
        }
    }

    /// Sets a state change hook.
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The breaker parameters.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The classifier deciding which failures count.
    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    /// Returns the current state.
    ///
    /// An open circuit whose break has elapsed still reports `Open`; the next
    /// admitted call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns true if the circuit is open.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Number of consecutive counted failures while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Time left until an open circuit admits a trial call.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => Some(self.remaining(&inner)),
            _ => None,
        }
    }

    /// Asks to run one call through the breaker.
    pub fn admit(&self) -> Result<CircuitPermit<'_>, PolicyError> {
        let (admission, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => (Ok(None), None),
                CircuitState::Open => {
                    let remaining = self.remaining(&inner);
                    if remaining.is_zero() {
                        let transition = self.transition(&mut inner, CircuitState::HalfOpen);
                        (Ok(Some(Self::grant_trial(&mut inner))), transition)
                    } else {
                        (Err(remaining), None)
                    }
                }
                CircuitState::HalfOpen if inner.trial.is_none() => {
                    (Ok(Some(Self::grant_trial(&mut inner))), None)
                }
                CircuitState::HalfOpen => (Err(Duration::ZERO), None),
            }
        };
        self.notify(transition);

        match admission {
            Ok(trial) => Ok(CircuitPermit {
                breaker: self,
                trial,
            }),
            Err(retry_after) => {
                tracing::debug!(
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Circuit breaker rejected call"
                );
                Err(PolicyError::CircuitOpen {
                    retry_after,
                    cause: None,
                })
            }
        }
    }

    /// Fails if the circuit is open. Used between attempts of an admitted call.
    pub fn check(&self) -> Result<(), PolicyError> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => Err(PolicyError::CircuitOpen {
                retry_after: self.remaining(&inner),
                cause: None,
            }),
            _ => Ok(()),
        }
    }

    /// Records a successful outcome of the call holding `permit`.
    ///
    /// While half-open only the trial call's outcome is taken into account.
    pub fn record_success(&self, permit: &CircuitPermit<'_>) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                _ if !self.issued(permit) => None,
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    inner.last_class = None;
                    None
                }
                CircuitState::HalfOpen if Self::holds_trial(&inner, permit) => {
                    self.transition(&mut inner, CircuitState::Closed)
                }
                // A call admitted before the circuit opened.
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Records a counted failure of the call holding `permit`. Returns true
    /// if this failure opened the circuit.
    ///
    /// While half-open only the trial call's outcome is taken into account.
    pub fn record_failure(&self, permit: &CircuitPermit<'_>, class: FailureClass) -> bool {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                _ if !self.issued(permit) => None,
                CircuitState::Closed => {
                    let restarts = self.config.count_per_failure_class
                        && inner.last_class.is_some_and(|last| last != class);
                    inner.consecutive_failures = if restarts {
                        1
                    } else {
                        inner.consecutive_failures.saturating_add(1)
                    };
                    inner.last_class = Some(class);

                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if Self::holds_trial(&inner, permit) => {
                    self.transition(&mut inner, CircuitState::Open)
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        let opened = transition.is_some();
        self.notify(transition);
        opened
    }

    /// Records a failure the classifier did not match.
    ///
    /// Breaks a run of consecutive failures but never opens the circuit.
    pub fn record_unmatched(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
            inner.last_class = None;
        }
    }

    /// Forces the circuit back to closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = self.transition(&mut inner, CircuitState::Closed);
            inner.consecutive_failures = 0;
            inner.last_class = None;
            transition
        };
        self.notify(transition);
    }

    fn remaining(&self, inner: &BreakerState) -> Duration {
        inner.opened_at.map_or(Duration::ZERO, |opened_at| {
            self.config
                .break_duration
                .saturating_sub(opened_at.elapsed())
        })
    }

    fn issued(&self, permit: &CircuitPermit<'_>) -> bool {
        std::ptr::eq(self, permit.breaker)
    }

    fn holds_trial(inner: &BreakerState, permit: &CircuitPermit<'_>) -> bool {
        permit.trial.is_some() && inner.trial == permit.trial
    }

    fn grant_trial(inner: &mut BreakerState) -> u64 {
        inner.generation = inner.generation.wrapping_add(1);
        inner.trial = Some(inner.generation);
        inner.generation
    }

    fn transition(&self, inner: &mut BreakerState, new_state: CircuitState) -> Transition {
        let old_state = inner.state;
        if old_state == new_state {
            return None;
        }

        inner.state = new_state;
        inner.trial = None;
        match new_state {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
                inner.last_class = None;
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.last_class = None;
            }
            CircuitState::HalfOpen => {}
        }
        Some((old_state, new_state))
    }

    fn notify(&self, transition: Transition) {
        if let Some((old_state, new_state)) = transition {
            match new_state {
                CircuitState::Open => tracing::warn!(
                    from = %old_state,
                    to = %new_state,
                    break_ms = u64::try_from(self.config.break_duration.as_millis()).unwrap_or(u64::MAX),
                    "Circuit breaker opened"
                ),
                _ => tracing::info!(from = %old_state, to = %new_state, "Circuit breaker state changed"),
            }
            if let Some(hook) = &self.hook {
                hook.on_state_change(old_state, new_state);
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("classifier", &self.classifier.name())
            .field("state", &self.state())
            .finish()
    }
}
