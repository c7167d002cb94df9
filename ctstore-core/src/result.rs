//! Operation results.

use serde::{Deserialize, Serialize};

/// Outcome of one executed operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// ETag after the operation, when one exists.
    pub etag: Option<String>,
    /// Number of entities affected: 0 or 1. Zero signals a no-op, such as
    /// DeleteIfExists on a missing key or a feed insert silently dropped by
    /// InsertIfNotEmpty.
    pub entities_affected: u32,
    /// Post-increment count, or new score for rank feeds.
    pub value: Option<f64>,
}

impl OperationResult {
    /// A result recording that nothing was affected.
    pub fn noop() -> Self {
        Self::default()
    }

    /// A result for a successful single-entity write.
    pub fn affected(etag: Option<String>) -> Self {
        Self {
            etag,
            entities_affected: 1,
            value: None,
        }
    }

    /// A result carrying a scalar value (increments, rank-feed scores).
    pub fn with_value(etag: Option<String>, value: f64) -> Self {
        Self {
            etag,
            entities_affected: 1,
            value: Some(value),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.entities_affected == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_result() {
        let r = OperationResult::noop();
        assert!(r.is_noop());
        assert_eq!(r.etag, None);
        assert_eq!(r.value, None);
    }

    #[test]
    fn test_affected_result() {
        let r = OperationResult::affected(Some("v1".to_string()));
        assert!(!r.is_noop());
        assert_eq!(r.entities_affected, 1);
        assert_eq!(r.etag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_value_result() {
        let r = OperationResult::with_value(Some("v2".to_string()), 5.0);
        assert_eq!(r.value, Some(5.0));
    }
}
