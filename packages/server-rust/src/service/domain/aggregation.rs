//! Lifecycle owner of an aggregation store and its recovery worker.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use camber_core::CorrelatedUnit;
use dashmap::DashSet;
use tracing::info;

use super::service_names;
use crate::aggregation::{
    retry_on_conflict, AggregationError, AggregationStore, DeadLetterSink, InProgressUnits,
    OptimisticLockRetryPolicy, RecoveredUnitHandler, RecoveryCommand, RecoveryTask,
};
use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::shutdown::ShutdownController;
use crate::service::worker::BackgroundWorker;

/// Owns the storage handle behind an [`AggregationStore`].
///
/// `init` verifies the backend and starts recovery (when enabled);
/// `shutdown` stops recovery and closes the backend.
pub struct AggregationService {
    store: Arc<AggregationStore>,
    handler: Arc<dyn RecoveredUnitHandler>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    shutdown: Option<Arc<ShutdownController>>,
    retry: OptimisticLockRetryPolicy,
    in_progress: InProgressUnits,
    worker: tokio::sync::Mutex<Option<BackgroundWorker<RecoveryTask>>>,
}

impl AggregationService {
    #[must_use]
    pub fn new(store: Arc<AggregationStore>, handler: Arc<dyn RecoveredUnitHandler>) -> Self {
        Self {
            store,
            handler,
            dead_letter: None,
            shutdown: None,
            retry: OptimisticLockRetryPolicy::default(),
            in_progress: Arc::new(DashSet::new()),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, controller: Arc<ShutdownController>) -> Self {
        self.shutdown = Some(controller);
        self
    }

    /// Backoff applied by [`aggregate`](Self::aggregate) on optimistic
    /// conflicts.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: OptimisticLockRetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    #[must_use]
    pub fn retry_policy(&self) -> &OptimisticLockRetryPolicy {
        &self.retry
    }

    /// Runs one correlation step for `key` and returns the stored aggregate.
    ///
    /// `merge` gets the current aggregate (if any) and builds its
    /// replacement. Pessimistic stores apply it under the map lock.
    /// Optimistic stores re-read and re-merge on every conflict, backing
    /// off per the retry policy, so `merge` may run more than once.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::RetriesExhausted`] once the policy gives
    /// up, or the underlying storage/snapshot error.
    pub async fn aggregate<F>(
        &self,
        key: &str,
        merge: F,
    ) -> Result<CorrelatedUnit, AggregationError>
    where
        F: Fn(Option<&CorrelatedUnit>) -> CorrelatedUnit,
    {
        if !self.store.config().optimistic() {
            return self.store.update(key, |current| merge(current.as_ref()));
        }
        retry_on_conflict(&self.retry, |_attempt| {
            let step = self.store.get(key).and_then(|current| {
                let next = merge(current.as_ref());
                self.store
                    .add_if(key, current.as_ref(), &next)
                    .map(|_| next)
            });
            std::future::ready(step)
        })
        .await
    }

    /// Unit ids currently being delivered, shared with the recovery worker.
    #[must_use]
    pub fn in_progress(&self) -> &InProgressUnits {
        &self.in_progress
    }

    /// Sends a command to the running recovery worker.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery is disabled or not started.
    pub async fn submit(&self, command: RecoveryCommand) -> anyhow::Result<()> {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.submit(command).await,
            None => Err(anyhow::anyhow!(
                "recovery is not running for map {}",
                self.store.map_name()
            )),
        }
    }

    #[must_use]
    pub async fn is_recovering(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(BackgroundWorker::is_running)
    }
}

#[async_trait]
impl ManagedService for AggregationService {
    fn name(&self) -> &'static str {
        service_names::AGGREGATION
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let engine = self.store.engine();
        engine
            .ping()
            .with_context(|| format!("{} backend is not usable", engine.name()))?;

        let config = self.store.config();
        info!(
            node = %ctx.config.node_id,
            map = config.map_name(),
            backend = engine.name(),
            optimistic = config.optimistic(),
            recovery = config.use_recovery(),
            "aggregation store ready"
        );

        if !config.use_recovery() {
            return Ok(());
        }
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        let mut task = RecoveryTask::new(Arc::clone(&self.store), Arc::clone(&self.handler))
            .with_in_progress(Arc::clone(&self.in_progress));
        if let Some(sink) = &self.dead_letter {
            task = task.with_dead_letter(Arc::clone(sink));
        }
        let controller = self.shutdown.as_ref().unwrap_or(&ctx.shutdown);
        task = task.with_shutdown(Arc::clone(controller));
        *worker = Some(BackgroundWorker::start_with_shutdown(
            task,
            config.recovery_interval(),
            controller.shutdown_receiver(),
        ));
        info!(
            map = config.map_name(),
            interval_ms = config.recovery_interval().as_millis(),
            "recovery started"
        );
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.in_progress.clear();
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }
        self.store
            .engine()
            .close()
            .context("failed to close aggregation backend")?;
        info!(map = self.store.map_name(), terminate, "aggregation store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::aggregation::AggregationConfig;
    use crate::service::config::ServerConfig;
    use crate::storage::engines::HashMapStorage;
    use crate::storage::StorageError;

    #[derive(Default)]
    struct Collector(Mutex<Vec<CorrelatedUnit>>);

    #[async_trait]
    impl RecoveredUnitHandler for Collector {
        async fn resubmit(&self, unit: CorrelatedUnit) -> anyhow::Result<()> {
            self.0.lock().push(unit);
            Ok(())
        }
    }

    fn ctx() -> ServiceContext {
        ServiceContext::new(ServerConfig::default())
    }

    fn service(use_recovery: bool) -> (AggregationService, Arc<Collector>) {
        service_with(use_recovery, false)
    }

    fn service_with(use_recovery: bool, optimistic: bool) -> (AggregationService, Arc<Collector>) {
        let config = AggregationConfig::builder("agg")
            .use_recovery(use_recovery)
            .optimistic(optimistic)
            .build()
            .unwrap();
        let store = Arc::new(AggregationStore::new(Arc::new(HashMapStorage::new()), config));
        let handler = Arc::new(Collector::default());
        (AggregationService::new(store, handler.clone()), handler)
    }

    fn increment(current: Option<&CorrelatedUnit>) -> CorrelatedUnit {
        let mut next = current
            .cloned()
            .unwrap_or_else(|| CorrelatedUnit::builder("counter").build());
        let count = next.header("count").and_then(|v| v.as_int()).unwrap_or(0);
        next.set_header("count", count + 1);
        next
    }

    fn count(service: &AggregationService) -> Option<i64> {
        service
            .store()
            .get("counter")
            .unwrap()
            .and_then(|u| u.header("count").and_then(|v| v.as_int()))
    }

    #[tokio::test]
    async fn scan_now_resubmits_pending_units() {
        let (service, handler) = service(true);
        let unit = CorrelatedUnit::builder("order-42").build();
        service.store().add("order-42", &unit).unwrap();
        service.store().remove("order-42", &unit).unwrap();

        service.init(&ctx()).await.unwrap();
        assert!(service.is_recovering().await);
        service.submit(RecoveryCommand::ScanNow).await.unwrap();

        for _ in 0..50 {
            if !handler.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.0.lock()[0].unit_id, unit.unit_id);
        assert!(service.in_progress().contains(&unit.unit_id));

        service.shutdown(false).await.unwrap();
        assert!(!service.is_recovering().await);
        assert!(matches!(
            service.store().engine().ping(),
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn recovery_disabled_starts_no_worker() {
        let (service, _) = service(false);
        service.init(&ctx()).await.unwrap();
        assert!(!service.is_recovering().await);
        assert!(service.submit(RecoveryCommand::ScanNow).await.is_err());
        service.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn init_fails_on_closed_backend() {
        let (service, _) = service(true);
        service.store().engine().close().unwrap();
        let err = service.init(&ctx()).await.unwrap_err();
        assert!(err.to_string().contains("backend is not usable"));
    }

    #[tokio::test]
    async fn reset_clears_in_progress() {
        let (service, _) = service(true);
        service.in_progress().insert("u-1".to_string());
        service.reset().await.unwrap();
        assert!(service.in_progress().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn optimistic_aggregate_retries_conflicts() {
        let (service, _) = service_with(false, true);
        let service = Arc::new(service.with_retry_policy(OptimisticLockRetryPolicy {
            retry_delay: Duration::from_millis(1),
            maximum_retry_delay: Duration::from_millis(5),
            exponential_backoff: false,
            random_backoff: true,
            ..OptimisticLockRetryPolicy::default()
        }));
        assert!(service.retry_policy().random_backoff);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        service.aggregate("counter", increment).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(count(&service), Some(80));
    }

    #[tokio::test]
    async fn pessimistic_aggregate_merges_under_lock() {
        let (service, _) = service(false);
        for _ in 0..3 {
            service.aggregate("counter", increment).await.unwrap();
        }
        assert_eq!(count(&service), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_gives_up_after_policy_limit() {
        let (service, _) = service_with(false, true);
        let service = service.with_retry_policy(OptimisticLockRetryPolicy {
            maximum_retries: 3,
            ..OptimisticLockRetryPolicy::default()
        });
        service.store().add_if("counter", None, &increment(None)).unwrap();
        let attempts = AtomicU32::new(0);

        // A competing writer lands between every read and write.
        let err = service
            .aggregate("counter", |current| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let current = current.cloned().unwrap();
                let competing = increment(Some(&current));
                service
                    .store()
                    .add_if("counter", Some(&current), &competing)
                    .unwrap();
                increment(Some(&current))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AggregationError::RetriesExhausted { attempts: 3 }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(count(&service), Some(4));
    }

    #[tokio::test]
    async fn commands_still_processed_after_shutdown_signal() {
        let (service, _) = service(true);
        let controller = Arc::new(ShutdownController::new());
        let service = service.with_shutdown(Arc::clone(&controller));
        let unit = CorrelatedUnit::builder("order-42").build();
        service.store().add("order-42", &unit).unwrap();
        service.store().remove("order-42", &unit).unwrap();

        service.init(&ctx()).await.unwrap();
        controller.trigger_shutdown();
        service
            .submit(RecoveryCommand::DeliveryCompleted {
                unit_id: unit.unit_id.clone(),
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if service.store().scan().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.store().scan().unwrap().is_empty());
        assert!(service.is_recovering().await);
        service.shutdown(false).await.unwrap();
    }
}
