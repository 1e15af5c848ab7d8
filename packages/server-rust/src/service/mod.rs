//! Service lifecycle framework.
//!
//! 1. **Registry** (`registry`): ordered init and reverse-order shutdown of
//!    [`ManagedService`]s
//! 2. **Domain services** (`domain`): aggregation store and health checks
//! 3. **Background workers** (`worker`): periodic tasks (recovery, health polling)
//! 4. **Shutdown** (`shutdown`): lifecycle state and in-flight draining

pub mod config;
pub mod domain;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use config::{ConfigError, HealthConfig, ServerConfig};
pub use domain::{service_names, AggregationService, HealthService};
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use shutdown::{InFlightGuard, LifecycleState, ShutdownController};
pub use worker::{BackgroundRunnable, BackgroundWorker};
