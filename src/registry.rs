//! Process-wide store of shared policy chains.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::resilience::PolicyChain;

/// Named policy chains shared between executors.
///
/// Executors built in shared mode look their chain up here on every call,
/// so they share circuit breaker state with every other executor using the
/// same name. Clones share the same store.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    chains: Arc<RwLock<HashMap<String, Arc<PolicyChain>>>>,
}

impl PolicyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the chain registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<PolicyChain>> {
        self.chains.read().get(name).cloned()
    }

    /// Registers `chain` under `name` unless an entry already exists, and
    /// returns the registered chain.
    ///
    /// Check and insert happen under one write lock.
    pub fn get_or_insert(&self, name: &str, chain: PolicyChain) -> Arc<PolicyChain> {
        let mut chains = self.chains.write();
        if let Some(existing) = chains.get(name) {
            tracing::debug!(name = name, "Reusing shared policy chain");
            return existing.clone();
        }

        tracing::debug!(name = name, policies = %chain.describe(), "Registering shared policy chain");
        let chain = Arc::new(chain);
        chains.insert(name.to_string(), chain.clone());
        chain
    }

    /// Returns true if a chain is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.chains.read().contains_key(name)
    }

    /// Removes the chain registered under `name`.
    ///
    /// Executors still pointing at the name fail on their next call.
    pub fn remove(&self, name: &str) -> Option<Arc<PolicyChain>> {
        self.chains.write().remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chains.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered chains.
    pub fn len(&self) -> usize {
        self.chains.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.chains.read().is_empty()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("names", &self.names())
            .finish()
    }
}
