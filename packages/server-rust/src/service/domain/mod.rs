//! Domain services managed by the [`ServiceRegistry`](crate::service::ServiceRegistry).

pub mod aggregation;
pub mod health;

pub use aggregation::AggregationService;
pub use health::HealthService;

// ---------------------------------------------------------------------------
// Service names
// ---------------------------------------------------------------------------

/// Registry names of the domain services.
pub mod service_names {
    pub const AGGREGATION: &str = "aggregation";
    pub const HEALTH: &str = "health";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::aggregation::{AggregationConfig, AggregationStore, RecoveredUnitHandler};
    use crate::health::HealthCheckRegistry;
    use crate::service::config::HealthConfig;
    use crate::service::registry::ServiceRegistry;
    use crate::storage::engines::HashMapStorage;

    struct Noop;

    #[async_trait::async_trait]
    impl RecoveredUnitHandler for Noop {
        async fn resubmit(&self, _unit: camber_core::CorrelatedUnit) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn services_register_under_their_names() {
        let store = Arc::new(AggregationStore::new(
            Arc::new(HashMapStorage::new()),
            AggregationConfig::default(),
        ));
        let registry = ServiceRegistry::new();
        registry.register(AggregationService::new(store, Arc::new(Noop)));
        registry.register(HealthService::new(
            Arc::new(HealthCheckRegistry::new()),
            &HealthConfig::default(),
            None,
        ));

        assert!(registry.get_by_name(service_names::AGGREGATION).is_some());
        assert!(registry.get_by_name(service_names::HEALTH).is_some());
        assert!(registry.get::<AggregationService>().is_some());
        assert!(registry.get::<HealthService>().is_some());
    }
}
