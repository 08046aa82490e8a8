//! Resilience policies: retry, circuit breaker, timeouts and fallback.
//!
//! Each policy is a plain value. [`PolicyChain`] stacks them in a fixed
//! order and the executors in [`crate::executor`] drive an operation
//! through the stack.

mod backoff;
mod chain;
mod circuit_breaker;
mod fallback;
mod retry;
mod timeout;

pub use backoff::{Backoff, BackoffFn};
pub use chain::{Policy, PolicyChain};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerHook, CircuitPermit, CircuitState};
pub use fallback::{AsyncFallbackFn, BlockingFallbackFn, FallbackHandler, FallbackPolicy};
pub use retry::{AttemptOutcome, ExecutionAttempt, RetryContext, RetryDecision, RetryHook, RetryPolicy};
pub use timeout::{TimeoutPolicy, TimeoutScope};

#[cfg(test)]
pub(crate) use circuit_breaker::MockCircuitBreakerHook;
#[cfg(test)]
pub(crate) use retry::MockRetryHook;
