//! Health-check registry, evaluation helper and built-in checks.
//!
//! - [`registry`]: checks, repositories, exclusion and exposure settings
//! - [`helper`]: ordered invocation against a [`HealthContext`]
//! - [`service`]: cached, periodically polled results
//! - [`report`]: serializable summaries
//! - [`checks`]: closure-backed, storage and lifecycle checks

pub mod checks;
pub mod helper;
pub mod registry;
pub mod report;
pub mod service;

pub use checks::{AggregationStoreHealthCheck, FnHealthCheck, LifecycleHealthCheck};
pub use helper::{
    invoke, invoke_by_id, invoke_liveness, invoke_readiness, invoke_with, is_results_up,
    HealthContext,
};
pub use registry::{
    ExposureLevel, HealthCheckRegistry, HealthCheckRepository, StaticHealthCheckRepository,
};
pub use report::{CheckReport, HealthReport};
pub use service::{CachedResult, HealthCheckService, PollingHealthCheckService};
