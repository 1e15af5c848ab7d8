//! [`StorageEngine`](super::StorageEngine) implementations.
//!
//! [`HashMapStorage`] keeps everything in memory; [`RedbStorage`] (feature
//! `redb`) persists to an embedded database file.

mod hashmap;
#[cfg(feature = "redb")]
mod redb_store;

pub use hashmap::HashMapStorage;
#[cfg(feature = "redb")]
pub use redb_store::RedbStorage;
