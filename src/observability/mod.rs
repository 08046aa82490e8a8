//! Observability: structured logging for policy executions.
//!
//! Every policy emits `tracing` events under the execution span:
//!
//! - `debug`: one event per attempt, with its outcome and elapsed time
//! - `info`: circuit breaker transitions
//! - `warn`: scheduled retries, timeouts, the circuit opening, fallback substitution
//! - `error`: exhausted retries and failing fallbacks
//!
//! ```rust,no_run
//! use integrations_sql_resilience::observability::{LogFormat, LogLevel, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//! # Ok(())
//! # }
//! ```

mod logging;

pub use logging::*;
