//! Factory for creating [`StorageEngine`] handles from configuration.
//!
//! [`StorageFactory`] is the single place that knows which backends exist.
//! The handle it returns is owned by the caller and passed explicitly to the
//! aggregation store and health checks that need it.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::storage::engine::{StorageEngine, StorageError};
use crate::storage::engines::HashMapStorage;

/// Which backend a [`StorageFactory`] opens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendConfig {
    /// Volatile in-memory storage.
    #[default]
    Memory,
    /// Durable storage in an embedded redb file.
    Redb { path: PathBuf },
}

/// Creates fully-initialised [`StorageEngine`] handles.
#[derive(Debug, Clone)]
pub struct StorageFactory {
    config: BackendConfig,
}

impl StorageFactory {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Opens the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the backend cannot be opened, or
    /// [`StorageError::Unavailable`] if it was compiled out.
    pub fn open(&self) -> Result<Arc<dyn StorageEngine>, StorageError> {
        match &self.config {
            BackendConfig::Memory => {
                info!(backend = "memory", "opening storage backend");
                Ok(Arc::new(HashMapStorage::new()))
            }
            BackendConfig::Redb { path } => Self::open_redb(path),
        }
    }

    #[cfg(feature = "redb")]
    fn open_redb(path: &std::path::Path) -> Result<Arc<dyn StorageEngine>, StorageError> {
        info!(backend = "redb", path = %path.display(), "opening storage backend");
        Ok(Arc::new(crate::storage::engines::RedbStorage::open(path)?))
    }

    #[cfg(not(feature = "redb"))]
    fn open_redb(path: &std::path::Path) -> Result<Arc<dyn StorageEngine>, StorageError> {
        Err(StorageError::Unavailable(format!(
            "redb support not compiled in (requested {})",
            path.display()
        )))
    }
}
