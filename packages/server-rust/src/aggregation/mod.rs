//! Correlation-keyed aggregation storage with crash recovery.
//!
//! - [`AggregationStore`]: live aggregates plus the recovery archive
//! - [`OptimisticLockRetryPolicy`]: backoff for callers that retry conflicts
//! - [`RecoveryTask`]: background resubmission of unconfirmed aggregates

pub mod config;
pub mod error;
pub mod recovery;
pub mod retry;
pub mod store;

pub use config::{AggregationConfig, AggregationConfigBuilder};
pub use error::AggregationError;
pub use recovery::{
    DeadLetterSink, InProgressUnits, LoggingRecoveryHandler, RecoveredUnitHandler,
    RecoveryCommand, RecoveryStats, RecoveryTask,
};
pub use retry::{retry_on_conflict, OptimisticLockRetryPolicy};
pub use store::AggregationStore;
