//! Camber server: correlation-keyed aggregation storage with crash recovery,
//! plus a health-check registry for the services around it.

pub mod aggregation;
pub mod cli;
pub mod health;
pub mod logging;
pub mod service;
pub mod storage;

pub use aggregation::{AggregationConfig, AggregationError, AggregationStore};
pub use health::{HealthCheckRegistry, HealthContext};
pub use storage::{StorageEngine, StorageFactory};
