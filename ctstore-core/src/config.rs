//! Store configuration.

use std::time::Duration;

/// Configuration for the CTStore execution pipeline.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a cache invalidation marker stays authoritative before a
    /// read-through is allowed to repair it.
    pub cache_expiry: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_expiry: Duration::from_secs(120),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the invalidation-marker expiry.
    pub fn with_cache_expiry(mut self, cache_expiry: Duration) -> Self {
        self.cache_expiry = cache_expiry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_expiry_is_two_minutes() {
        assert_eq!(StoreConfig::default().cache_expiry, Duration::from_secs(120));
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::new().with_cache_expiry(Duration::from_secs(30));
        assert_eq!(config.cache_expiry, Duration::from_secs(30));
    }
}
