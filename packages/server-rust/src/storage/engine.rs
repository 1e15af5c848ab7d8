//! Backing key-value engine trait and transaction types.
//!
//! Defines [`StorageEngine`], the innermost storage layer under the
//! aggregation store. Keys are strings scoped by a namespace (one per
//! logical map); values are opaque byte vectors. Engines furnish the four
//! primitives the aggregation store builds on: atomic put-if-absent, atomic
//! compare-and-swap, named exclusive locks, and multi-key transactions with
//! rollback.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Errors raised by a [`StorageEngine`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying store failed; the operation had no effect.
    #[error("storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The engine has been closed.
    #[error("storage engine is closed")]
    Closed,
    /// The requested backend is not available in this build.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// One step of a multi-key [`StorageEngine::transaction`].
///
/// `RemoveIfEquals` and `RemoveIfPresent` are guards: when they do not
/// match, the whole transaction is abandoned without side-effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Unconditional insert or replace.
    Put {
        namespace: String,
        key: String,
        value: Vec<u8>,
    },
    /// Unconditional removal (absent keys are fine).
    Remove { namespace: String, key: String },
    /// Removal that requires the stored bytes to equal `expected`.
    RemoveIfEquals {
        namespace: String,
        key: String,
        expected: Vec<u8>,
    },
    /// Removal that requires the key to exist.
    RemoveIfPresent { namespace: String, key: String },
}

/// Result of a transaction that reached the backend without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Every op was applied.
    Committed,
    /// The guard op at `index` did not match; nothing was applied.
    GuardFailed { index: usize },
}

/// Low-level namespaced key-value storage.
///
/// All operations are synchronous and individually atomic. Wrapped in
/// `Arc<dyn StorageEngine>` and handed explicitly to every component that
/// needs it; there is no process-wide instance.
pub trait StorageEngine: Send + Sync + 'static {
    /// Short backend name used in logs and health details.
    fn name(&self) -> &'static str;

    /// Retrieve the value for `key`, or `None` if not present.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or replace a value. Returns the previous value if any.
    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert only if `key` is absent.
    ///
    /// Returns `None` when the value was inserted, or the existing value
    /// (left untouched) when the key was already present.
    fn put_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the value only if the stored bytes equal `expected`.
    fn replace_if_equals(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StorageError>;

    /// Remove a value, returning it.
    fn remove(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove the value only if the stored bytes equal `expected`.
    fn remove_if_equals(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, StorageError>;

    /// All keys currently present in `namespace`.
    fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// Number of entries in `namespace`.
    fn len(&self, namespace: &str) -> Result<usize, StorageError>;

    /// Exclusive lock shared by every caller using the same `name`.
    ///
    /// Callers hold the guard for the scope of the mutation; dropping it
    /// releases the lock on every exit path.
    fn named_lock(&self, name: &str) -> Arc<Mutex<()>>;

    /// Apply `ops` atomically.
    ///
    /// Readers never observe a partially applied transaction. A failing
    /// guard yields [`TxnOutcome::GuardFailed`]; a backend failure rolls back
    /// and returns an error.
    fn transaction(&self, ops: Vec<TxnOp>) -> Result<TxnOutcome, StorageError>;

    /// Cheap liveness probe of the backend.
    fn ping(&self) -> Result<(), StorageError>;

    /// Release resources. Later calls fail with [`StorageError::Closed`].
    fn close(&self) -> Result<(), StorageError>;
}

/// In-process registry of named exclusive locks.
///
/// Lock handles are created on first use and live as long as the registry.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NamedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock registered under `name`, creating it if needed.
    pub fn get(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(name.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_locks_share_handle_per_name() {
        let locks = NamedLocks::new();
        let a = locks.get("agg-lock");
        let b = locks.get("agg-lock");
        let other = locks.get("other-lock");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        let _guard = a.lock();
        assert!(b.try_lock().is_none(), "same name must contend");
        assert!(other.try_lock().is_some(), "different names are independent");
    }

    #[test]
    fn storage_error_messages() {
        assert_eq!(StorageError::Closed.to_string(), "storage engine is closed");
        let err = StorageError::Backend("disk full".into());
        assert_eq!(err.to_string(), "storage backend failure: disk full");
    }
}
