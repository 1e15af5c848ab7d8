use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use camber_core::CorrelatedUnit;
use clap::Parser;
use tracing::{info, warn};

use camber_server::aggregation::{AggregationStore, DeadLetterSink, LoggingRecoveryHandler};
use camber_server::cli::{Cli, Command, HealthArgs, StoreOptions};
use camber_server::health::service::{CachedResult, PollListener};
use camber_server::health::{
    invoke, invoke_liveness, invoke_readiness, AggregationStoreHealthCheck, HealthCheckRegistry,
    HealthContext, HealthReport, LifecycleHealthCheck,
};
use camber_server::logging::init_tracing;
use camber_server::service::{
    AggregationService, HealthService, ServerConfig, ServiceContext, ServiceRegistry,
    ShutdownController,
};
use camber_server::storage::StorageFactory;

struct LoggingDeadLetter;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetter {
    async fn send(&self, uri: &str, unit: &CorrelatedUnit) -> anyhow::Result<()> {
        warn!(
            uri,
            unit_id = %unit.unit_id,
            key = %unit.correlation_key,
            "aggregate moved to dead letter"
        );
        Ok(())
    }
}

/// Storage, store and health registry shared by both subcommands.
struct Runtime {
    config: ServerConfig,
    store: Arc<AggregationStore>,
    controller: Arc<ShutdownController>,
    health: Arc<HealthCheckRegistry>,
}

impl Runtime {
    fn open(options: &StoreOptions) -> anyhow::Result<Self> {
        let config = options
            .to_server_config()
            .context("invalid configuration")?;
        let engine = StorageFactory::new(config.backend.clone())
            .open()
            .context("failed to open storage backend")?;
        let store = Arc::new(AggregationStore::new(engine, config.aggregation.clone()));
        let controller = Arc::new(ShutdownController::new());

        let health = Arc::new(HealthCheckRegistry::new());
        health.register(Arc::new(AggregationStoreHealthCheck::new(Arc::clone(&store))));
        health.register(Arc::new(LifecycleHealthCheck::new(Arc::clone(&controller))));

        Ok(Self {
            config,
            store,
            controller,
            health,
        })
    }
}

async fn serve(options: &StoreOptions) -> anyhow::Result<()> {
    let runtime = Runtime::open(options)?;
    let level = runtime.config.health.exposure_level;
    let listener: PollListener = Arc::new(move |cached: &[CachedResult]| {
        let results: Vec<_> = cached.iter().map(|(_, result)| result.clone()).collect();
        let report = HealthReport::render(&results, false, level, false);
        if report.is_up() {
            tracing::debug!(checks = results.len(), "health poll up");
        } else {
            match serde_json::to_string(&report) {
                Ok(json) => warn!(report = %json, "health poll down"),
                Err(e) => warn!(error = %e, "health poll down"),
            }
        }
    });

    let registry = ServiceRegistry::new();
    let handler = Arc::new(LoggingRecoveryHandler::new(Arc::clone(&runtime.store)));
    registry.register(
        AggregationService::new(Arc::clone(&runtime.store), handler)
            .with_dead_letter(Arc::new(LoggingDeadLetter))
            .with_shutdown(Arc::clone(&runtime.controller))
            .with_retry_policy(runtime.config.retry.clone()),
    );
    registry.register(HealthService::new(
        Arc::clone(&runtime.health),
        &runtime.config.health,
        Some(listener),
    ));

    let drain_timeout = runtime.config.drain_timeout;
    let ctx = ServiceContext {
        config: Arc::new(runtime.config),
        shutdown: Arc::clone(&runtime.controller),
    };
    registry.init_all(&ctx).await?;
    runtime.controller.set_ready();
    info!(node = %ctx.config.node_id, "camber ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    runtime.controller.trigger_shutdown();
    let drained = runtime.controller.wait_for_drain(drain_timeout).await;
    if !drained {
        warn!(
            in_flight = runtime.controller.in_flight_count(),
            "drain timed out, terminating"
        );
    }
    registry.shutdown_all(!drained).await?;
    info!("camber stopped");
    Ok(())
}

fn health(args: &HealthArgs) -> anyhow::Result<bool> {
    let runtime = Runtime::open(&args.store)?;
    runtime.health.set_enabled(runtime.config.health.enabled);
    runtime
        .health
        .set_exclude_pattern(runtime.config.health.exclude_pattern.as_deref());
    runtime.controller.set_ready();

    let ctx = HealthContext::with_registry(Arc::clone(&runtime.health));
    let results = if args.readiness {
        invoke_readiness(&ctx)
    } else if args.liveness {
        invoke_liveness(&ctx)
    } else {
        invoke(&ctx)
    };
    let report = HealthReport::render(
        &results,
        args.readiness,
        runtime.config.health.exposure_level,
        args.data,
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode health report")?
    );
    runtime
        .store
        .engine()
        .close()
        .context("failed to close storage backend")?;
    Ok(report.is_up())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format).context("failed to initialise logging")?;

    match cli.command {
        Command::Serve(options) => {
            serve(&options).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Health(args) => {
            let up = health(&args)?;
            Ok(if up { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}
