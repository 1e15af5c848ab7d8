//! Background recovery of completed-but-unconfirmed aggregates.
//!
//! [`RecoveryTask`] periodically scans the recovery namespace and
//! resubmits every archived unit that is not already being delivered. Each
//! resubmission is stamped with redelivery headers. Once the configured
//! redelivery limit is reached the unit goes to the dead-letter sink and is
//! confirmed, which removes it from recovery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use camber_core::unit::{
    REDELIVERED_HEADER, REDELIVERY_COUNTER_HEADER, REDELIVERY_MAX_COUNTER_HEADER,
};
use camber_core::CorrelatedUnit;
use dashmap::DashSet;
use tracing::{debug, info, trace, warn};

use super::store::AggregationStore;
use crate::service::shutdown::ShutdownController;
use crate::service::worker::BackgroundRunnable;

/// Counter of units resubmitted by recovery, labelled by map.
pub const RECOVERED_METRIC: &str = "camber_aggregation_recovered_total";

/// Downstream consumer of recovered units.
#[async_trait]
pub trait RecoveredUnitHandler: Send + Sync {
    /// Hands a recovered unit back to the processing pipeline.
    ///
    /// On eventual success the pipeline should submit
    /// [`RecoveryCommand::DeliveryCompleted`] or confirm the unit on the
    /// store directly; on failure [`RecoveryCommand::DeliveryFailed`].
    async fn resubmit(&self, unit: CorrelatedUnit) -> anyhow::Result<()>;
}

/// Handler for deployments whose downstream is the log itself.
///
/// Every recovered unit is logged and confirmed straight away. The next
/// sweep then drops its in-progress and redelivery bookkeeping.
pub struct LoggingRecoveryHandler {
    store: Arc<AggregationStore>,
}

impl LoggingRecoveryHandler {
    #[must_use]
    pub fn new(store: Arc<AggregationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveredUnitHandler for LoggingRecoveryHandler {
    async fn resubmit(&self, unit: CorrelatedUnit) -> anyhow::Result<()> {
        info!(
            map = self.store.map_name(),
            unit_id = %unit.unit_id,
            key = %unit.correlation_key,
            redelivery = ?unit.header(REDELIVERY_COUNTER_HEADER),
            "recovered aggregate delivered"
        );
        self.store.confirm(&unit.unit_id)?;
        Ok(())
    }
}

/// Destination for units that exhausted their redeliveries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, uri: &str, unit: &CorrelatedUnit) -> anyhow::Result<()>;
}

/// Unit ids whose delivery is currently in progress.
///
/// Shared between the recovery task and whatever drives delivery, so a
/// sweep never resubmits a unit that is already on its way.
pub type InProgressUnits = Arc<DashSet<String>>;

/// Commands accepted by a running [`RecoveryTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryCommand {
    /// Run a sweep immediately instead of waiting for the next tick.
    ScanNow,
    /// Downstream delivery succeeded: confirm and forget the unit.
    DeliveryCompleted { unit_id: String },
    /// Downstream delivery failed: make the unit eligible for the next sweep.
    DeliveryFailed { unit_id: String },
}

/// Tallies from one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub scanned: usize,
    pub skipped: usize,
    pub resubmitted: usize,
    pub dead_lettered: usize,
    pub failed: usize,
}

/// Periodic recovery sweep over one [`AggregationStore`].
pub struct RecoveryTask {
    store: Arc<AggregationStore>,
    handler: Arc<dyn RecoveredUnitHandler>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    in_progress: InProgressUnits,
    shutdown: Option<Arc<ShutdownController>>,
    redeliveries: HashMap<String, u32>,
}

impl RecoveryTask {
    #[must_use]
    pub fn new(store: Arc<AggregationStore>, handler: Arc<dyn RecoveredUnitHandler>) -> Self {
        Self {
            store,
            handler,
            dead_letter: None,
            in_progress: Arc::new(DashSet::new()),
            shutdown: None,
            redeliveries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    #[must_use]
    pub fn with_in_progress(mut self, in_progress: InProgressUnits) -> Self {
        self.in_progress = in_progress;
        self
    }

    /// Stops sweeps early once the controller leaves the running states.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownController>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[must_use]
    pub fn in_progress(&self) -> &InProgressUnits {
        &self.in_progress
    }

    /// Recovery attempts made so far for `unit_id`.
    #[must_use]
    pub fn redelivery_count(&self, unit_id: &str) -> u32 {
        self.redeliveries.get(unit_id).copied().unwrap_or(0)
    }

    /// Runs one sweep over the recovery namespace.
    pub async fn run_once(&mut self) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        let _in_flight = self.shutdown.as_ref().map(|s| s.in_flight_guard());
        let map = self.store.map_name().to_string();

        let unit_ids = match self.store.scan() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(map, error = %e, "recovery scan failed");
                return stats;
            }
        };
        // Units confirmed outside this task no longer show up in the scan.
        self.redeliveries.retain(|id, _| unit_ids.contains(id));
        self.in_progress.retain(|id| unit_ids.contains(id));
        if !unit_ids.is_empty() {
            trace!(map, pending = unit_ids.len(), "starting recovery sweep");
        }

        for unit_id in unit_ids {
            if self.shutdown.as_ref().is_some_and(|s| !s.is_running()) {
                debug!(map, "shutting down, stopping recovery sweep");
                break;
            }
            stats.scanned += 1;

            if self.in_progress.contains(&unit_id) {
                trace!(map, unit_id, "delivery in progress, skipping");
                stats.skipped += 1;
                continue;
            }

            let mut unit = match self.store.recover(&unit_id) {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    // Confirmed between scan and recover.
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(map, unit_id, error = %e, "failed to load unit for recovery");
                    stats.failed += 1;
                    continue;
                }
            };

            let attempts = self.redelivery_count(&unit_id);
            let maximum = self.store.config().maximum_redeliveries();
            unit.set_header(REDELIVERED_HEADER, true);

            if maximum > 0 && attempts >= maximum {
                unit.set_header(REDELIVERY_COUNTER_HEADER, attempts);
                unit.set_header(REDELIVERY_MAX_COUNTER_HEADER, maximum);
                if self.dead_letter_unit(&unit).await {
                    stats.dead_lettered += 1;
                } else {
                    stats.failed += 1;
                }
                continue;
            }

            let attempt = attempts + 1;
            self.redeliveries.insert(unit_id.clone(), attempt);
            unit.set_header(REDELIVERY_COUNTER_HEADER, attempt);
            if maximum > 0 {
                unit.set_header(REDELIVERY_MAX_COUNTER_HEADER, maximum);
            }

            debug!(
                map,
                unit_id,
                correlation_key = %unit.correlation_key,
                attempt,
                "resubmitting recovered unit"
            );
            self.in_progress.insert(unit_id.clone());
            match self.handler.resubmit(unit).await {
                Ok(()) => {
                    metrics::counter!(RECOVERED_METRIC, "map" => map.clone()).increment(1);
                    stats.resubmitted += 1;
                }
                Err(e) => {
                    self.in_progress.remove(&unit_id);
                    warn!(map, unit_id, error = %e, "failed to resubmit recovered unit");
                    stats.failed += 1;
                }
            }
        }

        if stats.resubmitted > 0 || stats.dead_lettered > 0 {
            info!(
                map,
                resubmitted = stats.resubmitted,
                dead_lettered = stats.dead_lettered,
                "recovery sweep finished"
            );
        }
        stats
    }

    /// Sends `unit` to the dead-letter sink and confirms it on success.
    async fn dead_letter_unit(&mut self, unit: &CorrelatedUnit) -> bool {
        let map = self.store.map_name();
        let (Some(sink), Some(uri)) = (&self.dead_letter, self.store.config().dead_letter_uri())
        else {
            warn!(
                map,
                unit_id = %unit.unit_id,
                "redeliveries exhausted but no dead letter sink is attached"
            );
            return false;
        };

        warn!(
            map,
            unit_id = %unit.unit_id,
            correlation_key = %unit.correlation_key,
            uri,
            "redeliveries exhausted, moving unit to dead letter"
        );
        if let Err(e) = sink.send(uri, unit).await {
            warn!(
                map,
                unit_id = %unit.unit_id,
                error = %e,
                "dead letter delivery failed, unit stays in recovery"
            );
            return false;
        }
        match self.store.confirm(&unit.unit_id) {
            Ok(_) => {
                self.redeliveries.remove(&unit.unit_id);
                true
            }
            Err(e) => {
                warn!(map, unit_id = %unit.unit_id, error = %e, "failed to confirm dead-lettered unit");
                false
            }
        }
    }

    fn delivery_completed(&mut self, unit_id: &str) {
        self.in_progress.remove(unit_id);
        self.redeliveries.remove(unit_id);
        if let Err(e) = self.store.confirm(unit_id) {
            warn!(map = self.store.map_name(), unit_id, error = %e, "failed to confirm delivered unit");
        }
    }

    fn delivery_failed(&mut self, unit_id: &str) {
        self.in_progress.remove(unit_id);
        trace!(
            map = self.store.map_name(),
            unit_id,
            attempts = self.redelivery_count(unit_id),
            "delivery failed, unit eligible for next sweep"
        );
    }
}

#[async_trait]
impl BackgroundRunnable for RecoveryTask {
    type Task = RecoveryCommand;

    async fn run(&mut self, task: RecoveryCommand) {
        match task {
            RecoveryCommand::ScanNow => {
                self.run_once().await;
            }
            RecoveryCommand::DeliveryCompleted { unit_id } => self.delivery_completed(&unit_id),
            RecoveryCommand::DeliveryFailed { unit_id } => self.delivery_failed(&unit_id),
        }
    }

    async fn on_tick(&mut self) {
        if self.store.config().use_recovery() {
            self.run_once().await;
        }
    }

    async fn shutdown(&mut self) {
        debug!(map = self.store.map_name(), "recovery task stopped");
    }
}
