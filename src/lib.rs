//! SQL Resilience Policies
//!
//! Composable resilience policies for database calls: retry with exponential
//! back-off, circuit breaking, overall and per-attempt timeouts, and
//! fallback. Policies are selected through a builder, validated once, and
//! applied to blocking closures or to futures.
//!
//! # Features
//!
//! - **Retry**: bounded attempts, `2^i` back-off, optional cap and jitter
//! - **Circuit Breaker**: consecutive-failure threshold, half-open trial, shared state
//! - **Timeouts**: over the whole execution or over each attempt
//! - **Fallback**: a last-resort handler when everything else fails
//! - **Shared Policies**: executors built under the same name share circuit state
//! - **Observability**: structured `tracing` events for every attempt and transition
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use integrations_sql_resilience::{Failure, PolicyBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let executor = PolicyBuilder::new()
//!         .use_async_executor()
//!         .with_default_policies()
//!         .with_transaction()
//!         .build()?;
//!
//!     let rows = executor
//!         .execute(|| async {
//!             // Report driver errors with their SQL error number.
//!             Err::<u64, _>(Failure::with_code(40613, "Database is not currently available"))
//!         })
//!         .await?;
//!
//!     println!("{} rows", rows);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod builder;
pub mod classifier;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod observability;
pub mod registry;
pub mod resilience;

// Re-exports for convenience
pub use builder::{AsyncPolicyBuilder, ChainBuilder, PolicyBuilder, SyncPolicyBuilder};
pub use classifier::{
    AnyClassifier, ErrorClassifier, ErrorCodeClassifier, FailureClass, TransactionErrorClassifier,
    TransientErrorClassifier,
};
pub use config::{CircuitBreakerConfig, PolicyOptions, RetryConfig};
pub use context::Context;
pub use errors::{ConfigurationError, Failure, PolicyError, PolicyResult};
pub use executor::{AsyncPolicyExecutor, SyncPolicyExecutor};
pub use registry::PolicyRegistry;
pub use resilience::{
    Backoff, CircuitBreaker, CircuitState, PolicyChain, TimeoutScope,
};
