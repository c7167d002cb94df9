//! Shared client-handle registry.
//!
//! The only shared mutable state in the process is this cache of opened
//! backend handles, keyed by endpoint and credentials. Population is an
//! insert-if-absent race: two callers may construct a handle for the same
//! key concurrently and one construction is discarded, which is cheaper
//! than serializing every lookup behind a lock.

use dashmap::DashMap;
use std::sync::Arc;

pub struct ClientRegistry<T> {
    clients: DashMap<String, Arc<T>>,
}

impl<T> ClientRegistry<T> {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Get the handle for `key`, constructing it when absent. `build` may
    /// run redundantly under contention; the stored handle wins.
    pub fn get_or_insert_with(&self, key: &str, build: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.clients.get(key) {
            return Arc::clone(&existing);
        }
        let candidate = Arc::new(build());
        self.clients
            .entry(key.to_string())
            .or_insert(candidate)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl<T> Default for ClientRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_is_constructed_once_per_key() {
        let registry: ClientRegistry<String> = ClientRegistry::new();
        let a = registry.get_or_insert_with("cache:primary", || "handle-1".to_string());
        let b = registry.get_or_insert_with("cache:primary", || "handle-2".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, "handle-1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_keys_get_distinct_handles() {
        let registry: ClientRegistry<String> = ClientRegistry::new();
        registry.get_or_insert_with("cache:primary", || "c".to_string());
        registry.get_or_insert_with("table:primary", || "t".to_string());
        assert_eq!(registry.len(), 2);
    }
}
