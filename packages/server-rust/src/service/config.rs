use std::time::Duration;

use crate::aggregation::{AggregationConfig, AggregationError, OptimisticLockRetryPolicy};
use crate::health::ExposureLevel;
use crate::storage::BackendConfig;

/// Errors raised while assembling a [`ServerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid aggregation settings: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("invalid health settings: {0}")]
    Health(String),
}

/// Health evaluation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Whether checks are evaluated at all.
    pub enabled: bool,
    /// Interval of the polling service. `None` evaluates on demand only.
    pub poll_interval: Option<Duration>,
    /// Comma-separated ids or patterns of checks to skip.
    pub exclude_pattern: Option<String>,
    pub exposure_level: ExposureLevel,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Some(Duration::from_secs(10)),
            exclude_pattern: None,
            exposure_level: ExposureLevel::Default,
        }
    }
}

impl HealthConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Health`] for a zero poll interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::Health(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique identifier for this node, used in logs.
    pub node_id: String,
    pub backend: BackendConfig,
    pub aggregation: AggregationConfig,
    pub retry: OptimisticLockRetryPolicy,
    pub health: HealthConfig,
    /// How long shutdown waits for in-flight work.
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// Builds a configuration around an already-validated aggregation config.
    #[must_use]
    pub fn new(aggregation: AggregationConfig) -> Self {
        Self {
            node_id: "camber".to_string(),
            backend: BackendConfig::default(),
            aggregation,
            retry: OptimisticLockRetryPolicy::default(),
            health: HealthConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }

    /// # Errors
    ///
    /// Returns the first invalid section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.health.validate()
    }
}

impl Default for ServerConfig {
    /// In-memory backend with a pessimistic `aggregation` map.
    fn default() -> Self {
        Self::new(AggregationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.aggregation.map_name(), "aggregation");
        assert_eq!(config.backend, BackendConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut config = ServerConfig::default();
        config.health.poll_interval = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::Health(_))));
    }

    #[test]
    fn conflicting_retry_backoff_rejected() {
        let mut config = ServerConfig::default();
        config.retry.random_backoff = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Aggregation(AggregationError::Configuration(_)))
        ));
    }
}
