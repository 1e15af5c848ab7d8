//! In-memory [`StorageEngine`] implementation backed by [`DashMap`].
//!
//! Single-key operations run concurrently under DashMap's fine-grained
//! sharding. Multi-key transactions take an exclusive gate so that no reader
//! can observe a half-applied transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::storage::engine::{NamedLocks, StorageEngine, StorageError, TxnOp, TxnOutcome};

type SlotKey = (String, String);

fn slot(namespace: &str, key: &str) -> SlotKey {
    (namespace.to_string(), key.to_string())
}

// ---------------------------------------------------------------------------
// HashMapStorage
// ---------------------------------------------------------------------------

/// In-memory storage backed by [`DashMap`].
///
/// The transaction gate is a reader/writer lock: every single-key operation
/// holds it shared, every transaction holds it exclusively.
pub struct HashMapStorage {
    entries: DashMap<SlotKey, Vec<u8>>,
    txn_gate: RwLock<()>,
    locks: NamedLocks,
    closed: AtomicBool,
}

impl HashMapStorage {
    /// Creates a new, empty `HashMapStorage`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            txn_gate: RwLock::new(()),
            locks: NamedLocks::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Restores the state captured in `undo`, newest first.
    fn roll_back(&self, undo: Vec<(SlotKey, Option<Vec<u8>>)>) {
        for (slot, previous) in undo.into_iter().rev() {
            match previous {
                Some(value) => {
                    self.entries.insert(slot, value);
                }
                None => {
                    self.entries.remove(&slot);
                }
            }
        }
    }
}

impl Default for HashMapStorage {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StorageEngine implementation
// ---------------------------------------------------------------------------

impl StorageEngine for HashMapStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        Ok(self.entries.get(&slot(namespace, key)).map(|v| v.clone()))
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        Ok(self.entries.insert(slot(namespace, key), value))
    }

    fn put_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        match self.entries.entry(slot(namespace, key)) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                Ok(None)
            }
        }
    }

    fn replace_if_equals(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        match self.entries.entry(slot(namespace, key)) {
            Entry::Occupied(mut existing) if existing.get().as_slice() == expected => {
                existing.insert(value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        Ok(self.entries.remove(&slot(namespace, key)).map(|(_, v)| v))
    }

    fn remove_if_equals(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        Ok(self
            .entries
            .remove_if(&slot(namespace, key), |_, v| v.as_slice() == expected)
            .is_some())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.key().1.clone())
            .collect())
    }

    fn len(&self, namespace: &str) -> Result<usize, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.read();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .count())
    }

    fn named_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.get(name)
    }

    fn transaction(&self, ops: Vec<TxnOp>) -> Result<TxnOutcome, StorageError> {
        self.ensure_open()?;
        let _gate = self.txn_gate.write();
        let mut undo: Vec<(SlotKey, Option<Vec<u8>>)> = Vec::with_capacity(ops.len());

        for (index, op) in ops.into_iter().enumerate() {
            match op {
                TxnOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    let slot = (namespace, key);
                    let previous = self.entries.insert(slot.clone(), value);
                    undo.push((slot, previous));
                }
                TxnOp::Remove { namespace, key } => {
                    let slot = (namespace, key);
                    let previous = self.entries.remove(&slot).map(|(_, v)| v);
                    undo.push((slot, previous));
                }
                TxnOp::RemoveIfEquals {
                    namespace,
                    key,
                    expected,
                } => {
                    let slot = (namespace, key);
                    match self.entries.remove_if(&slot, |_, v| *v == expected) {
                        Some((_, previous)) => undo.push((slot, Some(previous))),
                        None => {
                            self.roll_back(undo);
                            return Ok(TxnOutcome::GuardFailed { index });
                        }
                    }
                }
                TxnOp::RemoveIfPresent { namespace, key } => {
                    let slot = (namespace, key);
                    match self.entries.remove(&slot) {
                        Some((_, previous)) => undo.push((slot, Some(previous))),
                        None => {
                            self.roll_back(undo);
                            return Ok(TxnOutcome::GuardFailed { index });
                        }
                    }
                }
            }
        }

        Ok(TxnOutcome::Committed)
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
