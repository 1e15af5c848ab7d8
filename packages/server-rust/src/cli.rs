//! Command-line interface of the `camber` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::aggregation::{AggregationConfig, OptimisticLockRetryPolicy};
use crate::health::ExposureLevel;
use crate::logging::LogFormat;
use crate::service::config::{ConfigError, HealthConfig, ServerConfig};
use crate::storage::BackendConfig;

#[derive(Debug, Parser)]
#[command(name = "camber", version, about = "Aggregation store with crash recovery and health checks")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "CAMBER_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the aggregation and health services until interrupted.
    Serve(StoreOptions),
    /// Evaluate every health check once and print a JSON report.
    Health(HealthArgs),
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    #[command(flatten)]
    pub store: StoreOptions,

    /// Evaluate only readiness checks.
    #[arg(long, conflicts_with = "liveness")]
    pub readiness: bool,

    /// Evaluate only liveness checks.
    #[arg(long)]
    pub liveness: bool,

    /// Include check details in the report.
    #[arg(long)]
    pub data: bool,
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct StoreOptions {
    #[arg(long, env = "CAMBER_NODE_ID", default_value = "camber")]
    pub node_id: String,

    /// Namespace of live aggregates; recovery uses `<map>-completed`.
    #[arg(long, env = "CAMBER_MAP_NAME", default_value = "aggregation")]
    pub map_name: String,

    /// redb database file. Without it storage is in-memory.
    #[arg(long, env = "CAMBER_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Use compare-and-swap instead of the map lock.
    #[arg(long)]
    pub optimistic: bool,

    #[arg(long)]
    pub no_recovery: bool,

    #[arg(long, default_value_t = 5_000)]
    pub recovery_interval_ms: u64,

    /// Recovery attempts before dead-lettering. 0 retries forever.
    #[arg(long, default_value_t = 0)]
    pub maximum_redeliveries: u32,

    #[arg(long, env = "CAMBER_DEAD_LETTER_URI")]
    pub dead_letter_uri: Option<String>,

    /// Drop binary header values before storing aggregates.
    #[arg(long)]
    pub no_serialized_headers: bool,

    /// Health polling interval. 0 evaluates on demand only.
    #[arg(long, default_value_t = 10_000)]
    pub health_poll_ms: u64,

    /// Comma-separated check ids or patterns to skip.
    #[arg(long, env = "CAMBER_HEALTH_EXCLUDE")]
    pub health_exclude: Option<String>,

    #[arg(long, value_enum, default_value_t = ExposureLevel::Default)]
    pub exposure_level: ExposureLevel,

    #[arg(long, default_value_t = 30_000)]
    pub drain_timeout_ms: u64,

    /// Optimistic conflict retries before giving up. 0 retries forever.
    #[arg(long, default_value_t = 0)]
    pub retry_maximum: u32,

    #[arg(long, default_value_t = 50)]
    pub retry_delay_ms: u64,

    /// Upper bound on the backoff between optimistic retries.
    #[arg(long, default_value_t = 1_000)]
    pub retry_max_delay_ms: u64,

    /// Random backoff in `[0, retry-max-delay]` instead of exponential.
    #[arg(long)]
    pub retry_random: bool,
}

impl StoreOptions {
    /// Converts the parsed options into a validated [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any section is invalid.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut aggregation = AggregationConfig::builder(self.map_name.clone())
            .optimistic(self.optimistic)
            .use_recovery(!self.no_recovery)
            .recovery_interval(Duration::from_millis(self.recovery_interval_ms))
            .maximum_redeliveries(self.maximum_redeliveries)
            .allow_serialized_headers(!self.no_serialized_headers);
        if let Some(uri) = &self.dead_letter_uri {
            aggregation = aggregation.dead_letter_uri(uri.clone());
        }

        let backend = self
            .db_path
            .as_ref()
            .map_or(BackendConfig::Memory, |path| BackendConfig::Redb {
                path: path.clone(),
            });

        let mut config = ServerConfig::new(aggregation.build()?);
        config.node_id.clone_from(&self.node_id);
        config.backend = backend;
        config.health = HealthConfig {
            enabled: true,
            poll_interval: (self.health_poll_ms > 0)
                .then(|| Duration::from_millis(self.health_poll_ms)),
            exclude_pattern: self.health_exclude.clone(),
            exposure_level: self.exposure_level,
        };
        config.drain_timeout = Duration::from_millis(self.drain_timeout_ms);
        config.retry = OptimisticLockRetryPolicy {
            maximum_retries: self.retry_maximum,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            maximum_retry_delay: Duration::from_millis(self.retry_max_delay_ms),
            exponential_backoff: !self.retry_random,
            random_backoff: self.retry_random,
        };
        config.validate()?;
        Ok(config)
    }
}
