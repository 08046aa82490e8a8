//! Last-resort handler invoked when the rest of the chain fails.

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::errors::{Failure, PolicyError, PolicyResult};

/// Blocking fallback handler.
pub type BlockingFallbackFn = Arc<dyn Fn() -> Result<(), Failure> + Send + Sync>;

/// Asynchronous fallback handler.
pub type AsyncFallbackFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;

/// A caller-supplied fallback action.
///
/// Handlers produce no value; a caller that needs one captures it through
/// the closure's environment.
#[derive(Clone)]
pub enum FallbackHandler {
    /// Runs on the calling thread.
    Blocking(BlockingFallbackFn),
    /// Awaited on the calling task.
    Async(AsyncFallbackFn),
}

impl FallbackHandler {
    /// Wraps a blocking closure.
    pub fn blocking<F>(handler: F) -> Self
    where
        F: Fn() -> Result<(), Failure> + Send + Sync + 'static,
    {
        FallbackHandler::Blocking(Arc::new(handler))
    }

    /// Wraps a closure returning a future.
    ///
    /// When a blocking executor reaches this handler through a shared chain,
    /// the future is polled with `futures::executor::block_on`, so it must
    /// not depend on a tokio runtime.
    pub fn from_async<F, Fut>(handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        FallbackHandler::Async(Arc::new(move || handler().boxed()))
    }

    async fn invoke(&self) -> Result<(), Failure> {
        match self {
            FallbackHandler::Blocking(handler) => handler(),
            FallbackHandler::Async(handler) => handler().await,
        }
    }

    // An async handler reached from a blocking executor runs on a local
    // executor with no tokio reactor; tokio timers and I/O panic there.
    fn invoke_blocking(&self) -> Result<(), Failure> {
        match self {
            FallbackHandler::Blocking(handler) => handler(),
            FallbackHandler::Async(handler) => futures::executor::block_on(handler()),
        }
    }
}

impl fmt::Debug for FallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackHandler::Blocking(_) => f.write_str("FallbackHandler::Blocking"),
            FallbackHandler::Async(_) => f.write_str("FallbackHandler::Async"),
        }
    }
}

/// Converts any terminal failure of the inner chain into a call to the handler.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    handler: FallbackHandler,
}

impl FallbackPolicy {
    /// Creates a fallback policy.
    pub fn new(handler: FallbackHandler) -> Self {
        Self { handler }
    }

    /// The handler.
    pub fn handler(&self) -> &FallbackHandler {
        &self.handler
    }

    pub(crate) async fn recover<T: Default>(&self, error: PolicyError) -> PolicyResult<T> {
        tracing::warn!(error = %error, "Execution failed, running fallback");
        self.handler
            .invoke()
            .await
            .map(|()| T::default())
            .map_err(|source| Self::failed(source, &error))
    }

    pub(crate) fn recover_blocking<T: Default>(&self, error: PolicyError) -> PolicyResult<T> {
        tracing::warn!(error = %error, "Execution failed, running fallback");
        self.handler
            .invoke_blocking()
            .map(|()| T::default())
            .map_err(|source| Self::failed(source, &error))
    }

    fn failed(source: Failure, original: &PolicyError) -> PolicyError {
        tracing::error!(error = %source, original = %original, "Fallback failed");
        PolicyError::FallbackFailed { source }
    }
}
