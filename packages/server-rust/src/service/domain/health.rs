//! Lifecycle owner of the health registry and optional polling service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::service_names;
use crate::health::service::PollListener;
use crate::health::{
    HealthCheckRegistry, HealthCheckService, HealthContext, PollingHealthCheckService,
};
use crate::service::config::HealthConfig;
use crate::service::registry::{ManagedService, ServiceContext};

pub struct HealthService {
    registry: Arc<HealthCheckRegistry>,
    polling: Option<Arc<PollingHealthCheckService>>,
}

impl HealthService {
    /// Applies `config` to `registry` and prepares polling if an interval
    /// is configured.
    #[must_use]
    pub fn new(
        registry: Arc<HealthCheckRegistry>,
        config: &HealthConfig,
        listener: Option<PollListener>,
    ) -> Self {
        registry.set_enabled(config.enabled);
        registry.set_exclude_pattern(config.exclude_pattern.as_deref());
        registry.set_exposure_level(config.exposure_level);

        let polling = config.poll_interval.map(|interval| {
            let service = PollingHealthCheckService::new(Arc::clone(&registry), interval);
            let service = match listener {
                Some(listener) => service.with_listener(listener),
                None => service,
            };
            Arc::new(service)
        });
        Self { registry, polling }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HealthCheckRegistry> {
        &self.registry
    }

    /// Context for the health helper: cached results when polling,
    /// on-demand evaluation otherwise.
    #[must_use]
    pub fn context(&self) -> HealthContext {
        HealthContext::new(
            Some(Arc::clone(&self.registry)),
            self.polling
                .as_ref()
                .map(|p| Arc::clone(p) as Arc<dyn HealthCheckService>),
        )
    }
}

#[async_trait]
impl ManagedService for HealthService {
    fn name(&self) -> &'static str {
        service_names::HEALTH
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        if let Some(polling) = &self.polling {
            polling.start().await;
        }
        info!(
            checks = self.registry.get_check_ids().len(),
            polling = self.polling.is_some(),
            "health checks ready"
        );
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        if let Some(polling) = &self.polling {
            polling.refresh();
        }
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        if let Some(polling) = &self.polling {
            polling.stop().await;
        }
        Ok(())
    }
}
