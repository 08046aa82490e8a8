//! Back-off strategies between retry attempts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{duration_ms, option_duration_ms};

/// Signature of a caller-supplied back-off function.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Delay to wait after a failed attempt, as a function of that attempt's number.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `unit * 2^attempt`, optionally capped and jittered.
    Exponential {
        /// Base time unit.
        #[serde(with = "duration_ms", rename = "unit_ms")]
        unit: Duration,
        /// Upper bound for a single delay.
        #[serde(default, with = "option_duration_ms", rename = "max_ms")]
        max: Option<Duration>,
        /// Jitter factor (0.0 to 1.0).
        #[serde(default)]
        jitter: f64,
    },
    /// The same delay after every attempt.
    Constant {
        /// The delay.
        #[serde(with = "duration_ms", rename = "delay_ms")]
        delay: Duration,
    },
    /// A caller-supplied function.
    #[serde(skip)]
    Custom(BackoffFn),
}

impl Backoff {
    /// Exponential back-off with the given unit, no cap and no jitter.
    pub fn exponential(unit: Duration) -> Self {
        Backoff::Exponential {
            unit,
            max: None,
            jitter: 0.0,
        }
    }

    /// Constant back-off.
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Back-off computed by a closure receiving the failed attempt number.
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Backoff::Custom(Arc::new(f))
    }

    /// Caps exponential delays. No effect on other strategies.
    pub fn with_max(self, cap: Duration) -> Self {
        match self {
            Backoff::Exponential { unit, jitter, .. } => Backoff::Exponential {
                unit,
                max: Some(cap),
                jitter,
            },
            other => other,
        }
    }

    /// Adds jitter to exponential delays. No effect on other strategies.
    pub fn with_jitter(self, factor: f64) -> Self {
        match self {
            Backoff::Exponential { unit, max, .. } => Backoff::Exponential {
                unit,
                max,
                jitter: factor.clamp(0.0, 1.0),
            },
            other => other,
        }
    }

    /// Returns the delay after the given failed attempt (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { unit, max, jitter } => {
                let base = 2u32
                    .checked_pow(attempt)
                    .and_then(|factor| unit.checked_mul(factor))
                    .unwrap_or(Duration::MAX);
                let capped = match max {
                    Some(cap) => base.min(*cap),
                    None => base,
                };
                apply_jitter(capped, *jitter)
            }
            Backoff::Constant { delay } => *delay,
            Backoff::Custom(f) => f(attempt),
        }
    }

    /// Sum of all waits a retry budget of `max_attempts` can incur.
    ///
    /// Jitter is ignored.
    pub fn total_for(&self, max_attempts: u32) -> Duration {
        let deterministic = match self {
            Backoff::Exponential { unit, max, .. } => Backoff::Exponential {
                unit: *unit,
                max: *max,
                jitter: 0.0,
            },
            other => other.clone(),
        };
        (1..max_attempts)
            .map(|attempt| deterministic.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let secs = delay.as_secs_f64();
    let spread = secs * jitter;
    let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;
    Duration::try_from_secs_f64((secs + offset).max(0.0)).unwrap_or(delay)
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(crate::config::DEFAULT_BACKOFF_UNIT)
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Exponential { unit, max, jitter } => f
                .debug_struct("Exponential")
                .field("unit", unit)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Backoff::Constant { delay } => f.debug_struct("Constant").field("delay", delay).finish(),
            Backoff::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}
