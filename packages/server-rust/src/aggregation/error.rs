//! Error taxonomy for the aggregation store.

use camber_core::SnapshotError;

use crate::storage::StorageError;

/// Errors returned by [`AggregationStore`](super::AggregationStore) operations.
///
/// Conflicts are surfaced as-is and never retried by the store; callers
/// decide whether to rerun the correlation step (see
/// [`retry_on_conflict`](super::retry_on_conflict)).
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("optimistic lock conflict on correlation key {key}")]
    OptimisticLockConflict { key: String },

    #[error("invalid aggregation configuration: {0}")]
    Configuration(String),

    /// The atomic remove-and-archive step failed and was rolled back.
    #[error("transaction failed removing correlation key {key} (unit {unit_id})")]
    TransactionFailure {
        key: String,
        unit_id: String,
        #[source]
        source: StorageError,
    },

    #[error("operation not supported: {0}")]
    UnsupportedOperation(&'static str),

    #[error("exhausted optimistic locking retry attempts, tried {attempts} times")]
    RetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl AggregationError {
    /// Whether this error is a compare-and-swap conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::OptimisticLockConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn transaction_failure_names_both_keys() {
        let err = AggregationError::TransactionFailure {
            key: "order-42".to_string(),
            unit_id: "u-1".to_string(),
            source: StorageError::Closed,
        };
        let text = err.to_string();
        assert!(text.contains("order-42"));
        assert!(text.contains("u-1"));
        assert!(err.source().is_some());
    }

    #[test]
    fn conflict_is_detected() {
        let err = AggregationError::OptimisticLockConflict {
            key: "k".to_string(),
        };
        assert!(err.is_conflict());
        assert!(!AggregationError::Configuration("x".to_string()).is_conflict());
    }
}
