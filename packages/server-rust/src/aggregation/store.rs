//! Durable aggregation store.
//!
//! Holds in-progress aggregates keyed by correlation key under the
//! configured map namespace, and archives completed aggregates by unit id
//! under `{map}-completed` until downstream delivery is confirmed.
//!
//! Two disciplines are supported and fixed at construction:
//!
//! - **Pessimistic** (default): every mutation runs under the `{map}-lock`
//!   named lock. Use [`AggregationStore::add`] or [`AggregationStore::update`].
//! - **Optimistic**: mutations are compare-and-swap against the expected
//!   previous snapshot. Use [`AggregationStore::add_if`]; a mismatch yields
//!   [`AggregationError::OptimisticLockConflict`].
//!
//! Removal is always guarded by the caller's unit and, when recovery is
//! enabled, is a single transaction that deletes the live entry and archives
//! the unit. Either both effects happen or neither does.

use std::collections::BTreeSet;
use std::sync::Arc;

use camber_core::{CorrelatedUnit, UnitSnapshot};
use tracing::{debug, error, trace};

use super::config::AggregationConfig;
use super::error::AggregationError;
use crate::storage::{StorageEngine, TxnOp, TxnOutcome};

/// Counter of compare-and-swap conflicts, labelled by map.
pub const CONFLICTS_METRIC: &str = "camber_aggregation_conflicts_total";

/// Aggregation repository over a [`StorageEngine`].
pub struct AggregationStore {
    engine: Arc<dyn StorageEngine>,
    config: AggregationConfig,
    recovery_namespace: String,
    lock_name: String,
}

impl std::fmt::Debug for AggregationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationStore")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AggregationStore {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>, config: AggregationConfig) -> Self {
        let recovery_namespace = config.recovery_namespace();
        let lock_name = config.lock_name();
        Self {
            engine,
            config,
            recovery_namespace,
            lock_name,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    #[must_use]
    pub fn map_name(&self) -> &str {
        self.config.map_name()
    }

    #[must_use]
    pub fn recovery_namespace(&self) -> &str {
        &self.recovery_namespace
    }

    /// Optimistic insert or replace of the aggregate under `key`.
    ///
    /// With `expected == None` the key must be absent; otherwise the stored
    /// snapshot must equal the snapshot of `expected`. Returns the unit that
    /// was replaced, if any.
    ///
    /// # Errors
    ///
    /// - [`AggregationError::UnsupportedOperation`] in pessimistic mode.
    /// - [`AggregationError::OptimisticLockConflict`] if the stored state
    ///   does not match `expected`. Nothing is written in that case.
    pub fn add_if(
        &self,
        key: &str,
        expected: Option<&CorrelatedUnit>,
        unit: &CorrelatedUnit,
    ) -> Result<Option<CorrelatedUnit>, AggregationError> {
        if !self.config.optimistic() {
            return Err(AggregationError::UnsupportedOperation(
                "add with an expected previous unit requires optimistic locking",
            ));
        }
        let snapshot = self.encode(unit)?;
        let map = self.config.map_name();

        match expected {
            None => match self.engine.put_if_absent(map, key, snapshot.into_bytes())? {
                None => {
                    trace!(map, key, "inserted new aggregate");
                    Ok(None)
                }
                Some(_) => Err(self.conflict(key)),
            },
            Some(old) => {
                let old_snapshot = self.encode(old)?;
                if self.engine.replace_if_equals(
                    map,
                    key,
                    old_snapshot.as_bytes(),
                    snapshot.into_bytes(),
                )? {
                    trace!(map, key, "replaced aggregate");
                    Ok(Some(Self::decode(&old_snapshot)?))
                } else {
                    Err(self.conflict(key))
                }
            }
        }
    }

    /// Pessimistic insert or replace of the aggregate under `key`.
    ///
    /// Returns the previously stored unit, if any.
    ///
    /// # Errors
    ///
    /// [`AggregationError::UnsupportedOperation`] in optimistic mode, or a
    /// storage/snapshot error.
    pub fn add(
        &self,
        key: &str,
        unit: &CorrelatedUnit,
    ) -> Result<Option<CorrelatedUnit>, AggregationError> {
        if self.config.optimistic() {
            return Err(AggregationError::UnsupportedOperation(
                "add without an expected previous unit requires pessimistic locking",
            ));
        }
        let snapshot = self.encode(unit)?;
        let lock = self.engine.named_lock(&self.lock_name);
        let _guard = lock.lock();

        let previous = self
            .engine
            .put(self.config.map_name(), key, snapshot.into_bytes())?;
        previous
            .map(|bytes| Self::decode(&UnitSnapshot(bytes)))
            .transpose()
    }

    /// Pessimistic read-modify-write of the aggregate under `key`.
    ///
    /// `merge` receives the stored unit (if any) and returns its
    /// replacement. The map lock is held across the read and the write, so
    /// concurrent updates of one key never lose a step. Returns the stored
    /// replacement.
    ///
    /// # Errors
    ///
    /// [`AggregationError::UnsupportedOperation`] in optimistic mode, or a
    /// storage/snapshot error.
    pub fn update<F>(&self, key: &str, merge: F) -> Result<CorrelatedUnit, AggregationError>
    where
        F: FnOnce(Option<CorrelatedUnit>) -> CorrelatedUnit,
    {
        if self.config.optimistic() {
            return Err(AggregationError::UnsupportedOperation(
                "update under the map lock requires pessimistic locking",
            ));
        }
        let lock = self.engine.named_lock(&self.lock_name);
        let _guard = lock.lock();

        let next = merge(self.get(key)?);
        let snapshot = self.encode(&next)?;
        self.engine
            .put(self.config.map_name(), key, snapshot.into_bytes())?;
        trace!(map = self.config.map_name(), key, "updated aggregate");
        Ok(next)
    }

    /// Returns a fresh copy of the aggregate stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns a storage or snapshot error.
    pub fn get(&self, key: &str) -> Result<Option<CorrelatedUnit>, AggregationError> {
        self.engine
            .get(self.config.map_name(), key)?
            .map(|bytes| Self::decode(&UnitSnapshot(bytes)))
            .transpose()
    }

    /// Removes the aggregate under `key`, archiving `unit` for recovery.
    ///
    /// The stored snapshot must equal the snapshot of `unit`, in either
    /// mode. With recovery enabled the delete and the archive commit
    /// together.
    ///
    /// # Errors
    ///
    /// - [`AggregationError::OptimisticLockConflict`] if the key is absent or
    ///   holds a different unit. No archive entry is written.
    /// - [`AggregationError::TransactionFailure`] if the backend failed
    ///   mid-transaction. The transaction is rolled back.
    pub fn remove(&self, key: &str, unit: &CorrelatedUnit) -> Result<(), AggregationError> {
        let snapshot = self.encode(unit)?;
        let lock = (!self.config.optimistic()).then(|| self.engine.named_lock(&self.lock_name));
        let _guard = lock.as_ref().map(|l| l.lock());
        let map = self.config.map_name();

        if !self.config.use_recovery() {
            if self.engine.remove_if_equals(map, key, snapshot.as_bytes())? {
                trace!(map, key, "removed aggregate");
                return Ok(());
            }
            return Err(self.conflict(key));
        }

        let ops = vec![
            TxnOp::RemoveIfEquals {
                namespace: map.to_string(),
                key: key.to_string(),
                expected: snapshot.as_bytes().to_vec(),
            },
            TxnOp::Put {
                namespace: self.recovery_namespace.clone(),
                key: unit.unit_id.clone(),
                value: snapshot.into_bytes(),
            },
        ];

        match self.engine.transaction(ops) {
            Ok(TxnOutcome::Committed) => {
                debug!(map, key, unit_id = %unit.unit_id, "archived completed aggregate");
                Ok(())
            }
            Ok(TxnOutcome::GuardFailed { .. }) => Err(self.conflict(key)),
            Err(source) => {
                error!(
                    map,
                    key,
                    unit_id = %unit.unit_id,
                    error = %source,
                    "remove transaction rolled back"
                );
                Err(AggregationError::TransactionFailure {
                    key: key.to_string(),
                    unit_id: unit.unit_id.clone(),
                    source,
                })
            }
        }
    }

    /// Unit ids awaiting confirmation. Empty when recovery is disabled.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn scan(&self) -> Result<BTreeSet<String>, AggregationError> {
        if !self.config.use_recovery() {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .engine
            .keys(&self.recovery_namespace)?
            .into_iter()
            .collect())
    }

    /// Fetches an archived unit without removing it.
    ///
    /// # Errors
    ///
    /// Returns a storage or snapshot error.
    pub fn recover(&self, unit_id: &str) -> Result<Option<CorrelatedUnit>, AggregationError> {
        if !self.config.use_recovery() {
            return Ok(None);
        }
        self.engine
            .get(&self.recovery_namespace, unit_id)?
            .map(|bytes| Self::decode(&UnitSnapshot(bytes)))
            .transpose()
    }

    /// Deletes an archived unit after successful downstream delivery.
    ///
    /// Returns whether an entry was removed. Confirming an unknown id is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn confirm(&self, unit_id: &str) -> Result<bool, AggregationError> {
        if !self.config.use_recovery() {
            return Ok(false);
        }
        let lock = (!self.config.optimistic()).then(|| self.engine.named_lock(&self.lock_name));
        let _guard = lock.as_ref().map(|l| l.lock());

        let removed = self.engine.remove(&self.recovery_namespace, unit_id)?.is_some();
        if removed {
            debug!(map = self.config.map_name(), unit_id, "confirmed completed aggregate");
        } else {
            trace!(map = self.config.map_name(), unit_id, "confirm of unknown unit ignored");
        }
        Ok(removed)
    }

    /// Correlation keys currently held in the live namespace.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn keys(&self) -> Result<BTreeSet<String>, AggregationError> {
        Ok(self
            .engine
            .keys(self.config.map_name())?
            .into_iter()
            .collect())
    }

    /// Number of archived units awaiting confirmation.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn pending_recovery_count(&self) -> Result<usize, AggregationError> {
        if !self.config.use_recovery() {
            return Ok(0);
        }
        Ok(self.engine.len(&self.recovery_namespace)?)
    }

    fn encode(&self, unit: &CorrelatedUnit) -> Result<UnitSnapshot, AggregationError> {
        if self.config.allow_serialized_headers() {
            return Ok(unit.to_snapshot()?);
        }
        let mut stripped = unit.clone();
        stripped.strip_binary_headers();
        Ok(stripped.to_snapshot()?)
    }

    fn decode(snapshot: &UnitSnapshot) -> Result<CorrelatedUnit, AggregationError> {
        Ok(CorrelatedUnit::from_snapshot(snapshot)?)
    }

    fn conflict(&self, key: &str) -> AggregationError {
        metrics::counter!(CONFLICTS_METRIC, "map" => self.config.map_name().to_string())
            .increment(1);
        debug!(map = self.config.map_name(), key, "optimistic lock conflict");
        AggregationError::OptimisticLockConflict {
            key: key.to_string(),
        }
    }
}
