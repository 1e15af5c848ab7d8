//! Camber core: correlated units, their snapshot codec and the health-check vocabulary.

pub mod health;
pub mod types;
pub mod unit;

pub use health::{
    HealthCheck, HealthCheckResult, HealthCheckResultBuilder, HealthOptions, HealthState,
};
pub use types::Value;
pub use unit::{CorrelatedUnit, CorrelatedUnitBuilder, SnapshotError, UnitSnapshot};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
