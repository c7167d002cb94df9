//! Error types for CTStore operations.

use thiserror::Error;

/// Store operation errors.
///
/// The taxonomy is deliberately flat: every backend failure maps onto one of
/// these variants, and variants raised while executing a batch carry the
/// 0-based index of the failing operation as structured data so callers can
/// retry precisely.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entity already exists (operation {operation_index})")]
    Conflict { operation_index: usize },

    #[error("Entity not found (operation {operation_index})")]
    NotFound { operation_index: usize },

    #[error("ETag precondition failed (operation {operation_index})")]
    PreconditionFailed { operation_index: usize },

    #[error("Bad request (operation {operation_index}): {reason}")]
    BadRequest {
        operation_index: usize,
        reason: String,
    },

    #[error("Unexpected store failure: {reason}")]
    Unexpected { reason: String },
}

impl StoreError {
    /// The 0-based index of the failing operation, when the failure is tied
    /// to a specific operation in a batch.
    pub fn operation_index(&self) -> Option<usize> {
        match self {
            Self::Conflict { operation_index }
            | Self::NotFound { operation_index }
            | Self::PreconditionFailed { operation_index }
            | Self::BadRequest {
                operation_index, ..
            } => Some(*operation_index),
            Self::Unexpected { .. } => None,
        }
    }

    /// Rewrite the operation index, used when decoding a batch failure where
    /// the backend reported a position relative to a sub-batch.
    pub fn with_index(self, index: usize) -> Self {
        match self {
            Self::Conflict { .. } => Self::Conflict {
                operation_index: index,
            },
            Self::NotFound { .. } => Self::NotFound {
                operation_index: index,
            },
            Self::PreconditionFailed { .. } => Self::PreconditionFailed {
                operation_index: index,
            },
            Self::BadRequest { reason, .. } => Self::BadRequest {
                operation_index: index,
                reason,
            },
            other @ Self::Unexpected { .. } => other,
        }
    }

    /// Shorthand for an [`StoreError::Unexpected`] with a formatted reason.
    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self::Unexpected {
            reason: reason.into(),
        }
    }
}

/// The failure kinds a compiled cache script can abort with.
///
/// Scripts pre-register the failure kind per condition; on abort the result
/// array selects the kind by code and the decoder reconstructs the real
/// [`StoreError`] with the failing operation's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Conflict,
    NotFound,
    PreconditionFailed,
}

impl FailureKind {
    /// Stable wire code used in script result arrays.
    pub fn code(self) -> i64 {
        match self {
            Self::Conflict => 1,
            Self::NotFound => 2,
            Self::PreconditionFailed => 3,
        }
    }

    /// Decode a wire code back into a failure kind.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Conflict),
            2 => Some(Self::NotFound),
            3 => Some(Self::PreconditionFailed),
            _ => None,
        }
    }

    /// Materialize the error for the given failing operation index.
    pub fn to_error(self, operation_index: usize) -> StoreError {
        match self {
            Self::Conflict => StoreError::Conflict { operation_index },
            Self::NotFound => StoreError::NotFound { operation_index },
            Self::PreconditionFailed => StoreError::PreconditionFailed { operation_index },
        }
    }
}

/// Result type alias for CTStore operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_index() {
        let err = StoreError::PreconditionFailed { operation_index: 3 };
        let msg = format!("{}", err);
        assert!(msg.contains("precondition failed"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_with_index_rewrites_batch_position() {
        let err = StoreError::Conflict { operation_index: 0 }.with_index(7);
        assert_eq!(err.operation_index(), Some(7));

        let err = StoreError::BadRequest {
            operation_index: 0,
            reason: "oversized".to_string(),
        }
        .with_index(2);
        assert_eq!(err.operation_index(), Some(2));
    }

    #[test]
    fn test_unexpected_has_no_index() {
        let err = StoreError::unexpected("wrong result shape");
        assert_eq!(err.operation_index(), None);
        assert_eq!(err.clone().with_index(4), err);
    }

    #[test]
    fn test_failure_kind_code_roundtrip() {
        for kind in [
            FailureKind::Conflict,
            FailureKind::NotFound,
            FailureKind::PreconditionFailed,
        ] {
            assert_eq!(FailureKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(FailureKind::from_code(0), None);
    }

    #[test]
    fn test_failure_kind_to_error() {
        let err = FailureKind::NotFound.to_error(5);
        assert_eq!(err, StoreError::NotFound { operation_index: 5 });
    }
}
