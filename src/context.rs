//! Call-scoped context shared by every policy of one execution.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Data carried through one execution and handed to every attempt.
///
/// Cloning is cheap; clones share the same state. Blocking operations should
/// poll [`Context::is_cancelled`] at their own checkpoints, since a timeout
/// cannot interrupt a thread.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    operation_key: String,
    correlation_id: Uuid,
    attempt: AtomicU32,
    deadline: Mutex<Option<Instant>>,
    data: Mutex<HashMap<String, Value>>,
}

impl Context {
    /// Creates a context for the named operation.
    pub fn new(operation_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                operation_key: operation_key.into(),
                correlation_id: Uuid::new_v4(),
                attempt: AtomicU32::new(0),
                deadline: Mutex::new(None),
                data: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Adds a value, builder style.
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Stores a value, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.data.lock().insert(key.into(), value.into())
    }

    /// Returns a copy of the stored value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.data.lock().get(key).cloned()
    }

    /// The operation name given at creation.
    pub fn operation_key(&self) -> &str {
        &self.inner.operation_key
    }

    /// Identifier shared by every attempt of this execution.
    pub fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    /// The current attempt number (1-indexed, 0 before the first attempt).
    pub fn attempt(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    /// Returns true once the governing timeout of the current attempt has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Time left before the current attempt is cancelled, if bounded.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.inner
            .deadline
            .lock()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn begin_attempt(&self, attempt: u32, deadline: Option<Instant>) {
        self.inner.attempt.store(attempt, Ordering::SeqCst);
        *self.inner.deadline.lock() = deadline;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new("")
    }
}
