//! Fluent construction of policy executors.
//!
//! ```
//! use integrations_sql_resilience::{Failure, PolicyBuilder};
//!
//! let executor = PolicyBuilder::new()
//!     .use_sync_executor()
//!     .with_default_policies()
//!     .build()
//!     .expect("valid configuration");
//!
//! let rows = executor.execute(|| Ok::<_, Failure>(3)).expect("query succeeds");
//! assert_eq!(rows, 3);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::classifier::ErrorClassifier;
use crate::config::{CircuitBreakerConfig, PolicyOptions, RetryConfig};
use crate::errors::{ConfigurationError, Failure};
use crate::executor::{AsyncPolicyExecutor, ChainSource, SyncPolicyExecutor};
use crate::registry::PolicyRegistry;
use crate::resilience::{CircuitBreakerHook, FallbackHandler, PolicyChain, RetryHook};

/// Entry point: picks the executor flavor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyBuilder;

impl PolicyBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self
    }

    /// Builds a blocking executor with a private chain.
    pub fn use_sync_executor(self) -> SyncPolicyBuilder {
        ChainBuilder::new(None)
    }

    /// Builds a blocking executor whose chain is shared through `registry`.
    pub fn use_sync_executor_with_shared_policies(
        self,
        registry: &PolicyRegistry,
    ) -> SyncPolicyBuilder {
        ChainBuilder::new(Some(registry.clone()))
    }

    /// Builds an async executor with a private chain.
    pub fn use_async_executor(self) -> AsyncPolicyBuilder {
        ChainBuilder::new(None)
    }

    /// Builds an async executor whose chain is shared through `registry`.
    pub fn use_async_executor_with_shared_policies(
        self,
        registry: &PolicyRegistry,
    ) -> AsyncPolicyBuilder {
        ChainBuilder::new(Some(registry.clone()))
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Executor flavor of a [`ChainBuilder`].
pub trait ExecutionMode: sealed::Sealed {
    /// Prefix of registry keys derived for this flavor.
    const NAME: &'static str;
}

/// Marker for blocking executors.
#[derive(Debug, Clone, Copy)]
pub enum Blocking {}

/// Marker for async executors.
#[derive(Debug, Clone, Copy)]
pub enum Suspending {}

impl sealed::Sealed for Blocking {}
impl sealed::Sealed for Suspending {}

impl ExecutionMode for Blocking {
    const NAME: &'static str = "sync";
}

impl ExecutionMode for Suspending {
    const NAME: &'static str = "async";
}

/// Builder for blocking executors.
pub type SyncPolicyBuilder = ChainBuilder<Blocking>;

/// Builder for async executors.
pub type AsyncPolicyBuilder = ChainBuilder<Suspending>;

/// Accumulates policy selections. Nothing is validated until [`build`].
///
/// [`build`]: ChainBuilder::build
#[derive(Debug)]
pub struct ChainBuilder<M> {
    options: PolicyOptions,
    registry: Option<PolicyRegistry>,
    _mode: PhantomData<M>,
}

impl<M: ExecutionMode> ChainBuilder<M> {
    fn new(registry: Option<PolicyRegistry>) -> Self {
        Self {
            options: PolicyOptions::default(),
            registry,
            _mode: PhantomData,
        }
    }

    /// Starts from the given options instead of empty ones.
    ///
    /// Selections made before this call are replaced.
    pub fn with_options(mut self, options: PolicyOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds retry, circuit breaker and overall timeout together.
    pub fn with_default_policies(mut self) -> Self {
        self.options.default_policies = true;
        self
    }

    /// Adds a retry policy for transient errors.
    pub fn with_transient_errors(mut self) -> Self {
        self.options.transient_errors = true;
        self
    }

    /// Adds a circuit breaker.
    pub fn with_circuit_breaker(mut self) -> Self {
        self.options.circuit_breaker = true;
        self
    }

    /// Adds a timeout over the whole execution.
    pub fn with_overall_timeout(mut self) -> Self {
        self.options.overall_timeout = true;
        self
    }

    /// Adds a timeout over each attempt. Requires a retry policy.
    pub fn with_timeout_per_retry(mut self, timeout: Duration) -> Self {
        self.options.timeout_per_retry = Some(timeout);
        self
    }

    /// Also treats transaction errors as transient.
    pub fn with_transaction(mut self) -> Self {
        self.options.transaction_errors = true;
        self
    }

    /// Switches the throttling error class on or off.
    ///
    /// Without this call the class is on for chains that retry, and for
    /// chains that enable no other built-in class.
    pub fn with_throttling_errors(mut self, enabled: bool) -> Self {
        self.options.throttling_errors = Some(enabled);
        self
    }

    /// Overrides retry parameters.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.options.retry = config;
        self
    }

    /// Overrides circuit breaker parameters.
    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.options.breaker = config;
        self
    }

    /// Overrides the derived overall timeout.
    pub fn with_overall_timeout_duration(mut self, timeout: Duration) -> Self {
        self.options.overall_timeout_duration = Some(timeout);
        self
    }

    /// Adds a classifier, OR-combined with the built-in ones.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.options.classifiers.push(classifier);
        self
    }

    /// Observes scheduled retries.
    pub fn with_retry_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.options.retry_hook = Some(hook);
        self
    }

    /// Observes circuit state changes.
    pub fn with_circuit_breaker_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.options.breaker_hook = Some(hook);
        self
    }

    /// Sets the chain name, and the registry key in shared mode.
    pub fn with_policy_name(mut self, name: impl Into<String>) -> Self {
        self.options.policy_name = Some(name.into());
        self
    }

    /// The accumulated options.
    pub fn options(&self) -> &PolicyOptions {
        &self.options
    }

    fn into_source(self) -> Result<ChainSource, ConfigurationError> {
        let Self {
            mut options,
            registry,
            ..
        } = self;

        match registry {
            None => Ok(ChainSource::Owned(Arc::new(PolicyChain::from_options(
                &options,
            )?))),
            Some(registry) => {
                let name = options.policy_name.clone().unwrap_or_else(|| {
                    format!("{}:{}", M::NAME, options.policy_names().join("_"))
                });
                options.policy_name = Some(name.clone());

                let chain = PolicyChain::from_options(&options)?;
                registry.get_or_insert(&name, chain);
                Ok(ChainSource::Shared { registry, name })
            }
        }
    }
}

impl ChainBuilder<Blocking> {
    /// Adds a fallback run when the chain ultimately fails.
    ///
    /// In shared mode the chain registered first keeps its handler. If that
    /// chain came from an async builder, its handler is driven with
    /// `futures::executor::block_on` on the calling thread, outside any tokio
    /// runtime, so a handler that needs tokio timers or I/O panics there.
    /// Give sync executors their own policy name in that case.
    pub fn with_fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn() -> Result<(), Failure> + Send + Sync + 'static,
    {
        self.options.fallback = Some(FallbackHandler::blocking(handler));
        self
    }

    /// Validates the selection and creates the executor.
    pub fn build(self) -> Result<SyncPolicyExecutor, ConfigurationError> {
        self.into_source().map(SyncPolicyExecutor::new)
    }
}

impl ChainBuilder<Suspending> {
    /// Adds a fallback run when the chain ultimately fails.
    pub fn with_fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        self.options.fallback = Some(FallbackHandler::from_async(handler));
        self
    }

    /// Validates the selection and creates the executor.
    pub fn build(self) -> Result<AsyncPolicyExecutor, ConfigurationError> {
        self.into_source().map(AsyncPolicyExecutor::new)
    }
}
