//! Persistent [`StorageEngine`] implementation backed by an embedded `redb` database.
//!
//! Each namespace maps to one redb table of `&str -> &[u8]`. Every mutation
//! runs in its own redb write transaction, so compare-and-swap and multi-op
//! transactions inherit redb's serializable commit/abort semantics. Named
//! locks are in-process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::storage::engine::{NamedLocks, StorageEngine, StorageError, TxnOp, TxnOutcome};

fn table(namespace: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(namespace)
}

fn backend<E: Into<redb::Error>>(err: E) -> StorageError {
    StorageError::Backend(Box::new(err.into()))
}

/// Durable storage in a single redb file.
pub struct RedbStorage {
    db: Database,
    locks: NamedLocks,
    closed: AtomicBool,
}

impl RedbStorage {
    /// Opens (or creates) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(backend)?;
        Ok(Self {
            db,
            locks: NamedLocks::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Runs `read` against the namespace table, or returns `empty` if the
    /// table has never been written.
    fn read_table<T>(
        &self,
        namespace: &str,
        empty: T,
        read: impl FnOnce(&redb::ReadOnlyTable<&'static str, &'static [u8]>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_open()?;
        let txn = self.db.begin_read().map_err(backend)?;
        match txn.open_table(table(namespace)) {
            Ok(t) => read(&t),
            Err(TableError::TableDoesNotExist(_)) => Ok(empty),
            Err(e) => Err(backend(e)),
        }
    }

    /// Runs `write` inside a write transaction on the namespace table.
    ///
    /// The transaction commits when `write` returns `(value, true)` and
    /// aborts when it returns `(value, false)`.
    fn write_table<T>(
        &self,
        namespace: &str,
        write: impl FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> Result<(T, bool), StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_open()?;
        let txn = self.db.begin_write().map_err(backend)?;
        let (value, commit) = {
            let mut t = txn.open_table(table(namespace)).map_err(backend)?;
            write(&mut t)?
        };
        if commit {
            txn.commit().map_err(backend)?;
        } else {
            txn.abort().map_err(backend)?;
        }
        Ok(value)
    }
}

fn current(
    t: &redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(t.get(key).map_err(backend)?.map(|g| g.value().to_vec()))
}

impl StorageEngine for RedbStorage {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_table(namespace, None, |t| {
            Ok(t.get(key).map_err(backend)?.map(|g| g.value().to_vec()))
        })
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.write_table(namespace, |t| {
            let previous = t
                .insert(key, value.as_slice())
                .map_err(backend)?
                .map(|g| g.value().to_vec());
            Ok((previous, true))
        })
    }

    fn put_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.write_table(namespace, |t| {
            if let Some(existing) = current(t, key)? {
                return Ok((Some(existing), false));
            }
            t.insert(key, value.as_slice()).map_err(backend)?;
            Ok((None, true))
        })
    }

    fn replace_if_equals(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StorageError> {
        self.write_table(namespace, |t| {
            if current(t, key)?.as_deref() != Some(expected) {
                return Ok((false, false));
            }
            t.insert(key, value.as_slice()).map_err(backend)?;
            Ok((true, true))
        })
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.write_table(namespace, |t| {
            let previous = t
                .remove(key)
                .map_err(backend)?
                .map(|g| g.value().to_vec());
            let changed = previous.is_some();
            Ok((previous, changed))
        })
    }

    fn remove_if_equals(
        &self,
        namespace: &str,
        key: &str,
        expected: &[u8],
    ) -> Result<bool, StorageError> {
        self.write_table(namespace, |t| {
            if current(t, key)?.as_deref() != Some(expected) {
                return Ok((false, false));
            }
            t.remove(key).map_err(backend)?;
            Ok((true, true))
        })
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        self.read_table(namespace, Vec::new(), |t| {
            let mut keys = Vec::new();
            for entry in t.iter().map_err(backend)? {
                let (k, _) = entry.map_err(backend)?;
                keys.push(k.value().to_string());
            }
            Ok(keys)
        })
    }

    fn len(&self, namespace: &str) -> Result<usize, StorageError> {
        Ok(self.keys(namespace)?.len())
    }

    fn named_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.get(name)
    }

    fn transaction(&self, ops: Vec<TxnOp>) -> Result<TxnOutcome, StorageError> {
        self.ensure_open()?;
        let txn = self.db.begin_write().map_err(backend)?;

        for (index, op) in ops.iter().enumerate() {
            let applied = match op {
                TxnOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    let mut t = txn.open_table(table(namespace)).map_err(backend)?;
                    t.insert(key.as_str(), value.as_slice()).map_err(backend)?;
                    true
                }
                TxnOp::Remove { namespace, key } => {
                    let mut t = txn.open_table(table(namespace)).map_err(backend)?;
                    t.remove(key.as_str()).map_err(backend)?;
                    true
                }
                TxnOp::RemoveIfEquals {
                    namespace,
                    key,
                    expected,
                } => {
                    let mut t = txn.open_table(table(namespace)).map_err(backend)?;
                    if current(&t, key)?.as_deref() == Some(expected.as_slice()) {
                        t.remove(key.as_str()).map_err(backend)?;
                        true
                    } else {
                        false
                    }
                }
                TxnOp::RemoveIfPresent { namespace, key } => {
                    let mut t = txn.open_table(table(namespace)).map_err(backend)?;
                    let previous = t.remove(key.as_str()).map_err(backend)?;
                    previous.is_some()
                }
            };

            if !applied {
                txn.abort().map_err(backend)?;
                return Ok(TxnOutcome::GuardFailed { index });
            }
        }

        txn.commit().map_err(backend)?;
        Ok(TxnOutcome::Committed)
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.db.begin_read().map_err(backend)?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
