//! Immutable aggregation store configuration.

use std::time::Duration;

use super::error::AggregationError;

/// Configuration of one [`AggregationStore`](super::AggregationStore).
///
/// Built once through [`AggregationConfig::builder`] and never mutated; the
/// concurrency discipline it selects is fixed for the store's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    map_name: String,
    optimistic: bool,
    use_recovery: bool,
    recovery_interval: Duration,
    maximum_redeliveries: u32,
    dead_letter_uri: Option<String>,
    allow_serialized_headers: bool,
}

impl AggregationConfig {
    /// Starts a builder for a store over the namespace `map_name`.
    #[must_use]
    pub fn builder(map_name: impl Into<String>) -> AggregationConfigBuilder {
        AggregationConfigBuilder {
            map_name: map_name.into(),
            optimistic: false,
            use_recovery: true,
            recovery_interval: Duration::from_secs(5),
            maximum_redeliveries: 0,
            dead_letter_uri: None,
            allow_serialized_headers: true,
        }
    }

    /// Namespace holding live units keyed by correlation key.
    #[must_use]
    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    /// Namespace holding removed-but-unconfirmed units keyed by unit id.
    #[must_use]
    pub fn recovery_namespace(&self) -> String {
        format!("{}-completed", self.map_name)
    }

    /// Name of the exclusive lock guarding pessimistic mutations.
    #[must_use]
    pub fn lock_name(&self) -> String {
        format!("{}-lock", self.map_name)
    }

    #[must_use]
    pub fn optimistic(&self) -> bool {
        self.optimistic
    }

    #[must_use]
    pub fn use_recovery(&self) -> bool {
        self.use_recovery
    }

    #[must_use]
    pub fn recovery_interval(&self) -> Duration {
        self.recovery_interval
    }

    /// Recovery attempts before a unit goes to the dead-letter sink. 0 = unlimited.
    #[must_use]
    pub fn maximum_redeliveries(&self) -> u32 {
        self.maximum_redeliveries
    }

    #[must_use]
    pub fn dead_letter_uri(&self) -> Option<&str> {
        self.dead_letter_uri.as_deref()
    }

    /// Whether binary header values are kept in stored snapshots.
    #[must_use]
    pub fn allow_serialized_headers(&self) -> bool {
        self.allow_serialized_headers
    }
}

impl Default for AggregationConfig {
    /// Pessimistic store over the `aggregation` map with recovery enabled.
    fn default() -> Self {
        Self {
            map_name: "aggregation".to_string(),
            optimistic: false,
            use_recovery: true,
            recovery_interval: Duration::from_secs(5),
            maximum_redeliveries: 0,
            dead_letter_uri: None,
            allow_serialized_headers: true,
        }
    }
}

/// Builder for [`AggregationConfig`].
#[derive(Debug, Clone)]
pub struct AggregationConfigBuilder {
    map_name: String,
    optimistic: bool,
    use_recovery: bool,
    recovery_interval: Duration,
    maximum_redeliveries: u32,
    dead_letter_uri: Option<String>,
    allow_serialized_headers: bool,
}

impl AggregationConfigBuilder {
    #[must_use]
    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    #[must_use]
    pub fn use_recovery(mut self, use_recovery: bool) -> Self {
        self.use_recovery = use_recovery;
        self
    }

    #[must_use]
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    #[must_use]
    pub fn maximum_redeliveries(mut self, maximum: u32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    #[must_use]
    pub fn dead_letter_uri(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn allow_serialized_headers(mut self, allow: bool) -> Self {
        self.allow_serialized_headers = allow;
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::Configuration`] if the map name is blank,
    /// the recovery interval is zero while recovery is enabled, or a
    /// redelivery limit is set without a dead-letter uri.
    pub fn build(self) -> Result<AggregationConfig, AggregationError> {
        if self.map_name.trim().is_empty() {
            return Err(AggregationError::Configuration(
                "map name must not be empty".to_string(),
            ));
        }
        if self.use_recovery && self.recovery_interval.is_zero() {
            return Err(AggregationError::Configuration(
                "recovery interval must be positive".to_string(),
            ));
        }
        let dead_letter_uri = self.dead_letter_uri.filter(|uri| !uri.trim().is_empty());
        if self.maximum_redeliveries > 0 && dead_letter_uri.is_none() {
            return Err(AggregationError::Configuration(format!(
                "dead letter uri must be configured when maximum redeliveries is {}",
                self.maximum_redeliveries
            )));
        }
        Ok(AggregationConfig {
            map_name: self.map_name,
            optimistic: self.optimistic,
            use_recovery: self.use_recovery,
            recovery_interval: self.recovery_interval,
            maximum_redeliveries: self.maximum_redeliveries,
            dead_letter_uri,
            allow_serialized_headers: self.allow_serialized_headers,
        })
    }
}
