//! Backing storage for the aggregation store.
//!
//! - [`StorageEngine`]: namespaced key-value trait with CAS, named locks and
//!   multi-key transactions
//! - [`engines`]: in-memory and redb implementations
//! - [`StorageFactory`]: builds an engine handle from [`BackendConfig`]

pub mod engine;
pub mod engines;
pub mod factory;

pub use engine::*;
pub use factory::{BackendConfig, StorageFactory};
