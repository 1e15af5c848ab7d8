//! Push-model health evaluation.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use camber_core::{HealthCheck, HealthCheckResult, HealthOptions};
use tracing::{debug, warn};

use super::helper::ordered_checks;
use super::registry::HealthCheckRegistry;
use crate::service::worker::{BackgroundRunnable, BackgroundWorker};

/// A check paired with its most recent result.
pub type CachedResult = (Arc<dyn HealthCheck>, HealthCheckResult);

/// Callback invoked with the results of every poll.
pub type PollListener = Arc<dyn Fn(&[CachedResult]) + Send + Sync>;

/// Source of pre-computed health results.
pub trait HealthCheckService: Send + Sync {
    /// The most recent result of every evaluated check, in execution order.
    fn results(&self) -> Vec<CachedResult>;

    /// Evaluates one check immediately.
    fn call(&self, id: &str, options: &HealthOptions) -> Option<HealthCheckResult>;
}

/// Evaluates the registry on a fixed interval and caches the results.
pub struct PollingHealthCheckService {
    registry: Arc<HealthCheckRegistry>,
    cache: Arc<ArcSwap<Vec<CachedResult>>>,
    poll_interval: Duration,
    listener: Option<PollListener>,
    worker: tokio::sync::Mutex<Option<BackgroundWorker<HealthPollTask>>>,
}

impl PollingHealthCheckService {
    #[must_use]
    pub fn new(registry: Arc<HealthCheckRegistry>, poll_interval: Duration) -> Self {
        Self {
            registry,
            cache: Arc::new(ArcSwap::from_pointee(Vec::new())),
            poll_interval,
            listener: None,
            worker: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: PollListener) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Evaluates every check now and replaces the cache.
    pub fn refresh(&self) {
        poll(&self.registry, &self.cache, self.listener.as_ref());
    }

    /// Performs an initial poll and starts periodic polling.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        self.refresh();
        let task = HealthPollTask {
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            listener: self.listener.clone(),
        };
        *worker = Some(BackgroundWorker::start(task, self.poll_interval));
        debug!(interval_ms = self.poll_interval.as_millis(), "health polling started");
    }

    /// Requests an immediate poll on the background worker.
    ///
    /// # Errors
    ///
    /// Returns an error if polling has not been started.
    pub async fn poll_now(&self) -> anyhow::Result<()> {
        match self.worker.lock().await.as_ref() {
            Some(worker) => worker.submit(HealthPollCommand::PollNow).await,
            None => Err(anyhow::anyhow!("health polling not started")),
        }
    }

    pub async fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }
    }
}

impl HealthCheckService for PollingHealthCheckService {
    fn results(&self) -> Vec<CachedResult> {
        self.cache.load().as_ref().clone()
    }

    fn call(&self, id: &str, options: &HealthOptions) -> Option<HealthCheckResult> {
        self.registry.get_check(id).map(|check| check.call(options))
    }
}

fn poll(
    registry: &HealthCheckRegistry,
    cache: &ArcSwap<Vec<CachedResult>>,
    listener: Option<&PollListener>,
) {
    let options = HealthOptions::new();
    let results: Vec<CachedResult> = ordered_checks(registry, |_| true)
        .into_iter()
        .map(|check| {
            let result = check.call(&options);
            (check, result)
        })
        .collect();
    if let Some(listener) = listener {
        listener(&results);
    }
    cache.store(Arc::new(results));
}

/// Commands for the polling worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPollCommand {
    PollNow,
}

/// Runnable that evaluates the registry off the async executor threads.
pub struct HealthPollTask {
    registry: Arc<HealthCheckRegistry>,
    cache: Arc<ArcSwap<Vec<CachedResult>>>,
    listener: Option<PollListener>,
}

impl HealthPollTask {
    async fn poll_blocking(&self) {
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let listener = self.listener.clone();
        let outcome =
            tokio::task::spawn_blocking(move || poll(&registry, &cache, listener.as_ref())).await;
        if let Err(e) = outcome {
            warn!(error = %e, "health poll panicked");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for HealthPollTask {
    type Task = HealthPollCommand;

    async fn run(&mut self, task: HealthPollCommand) {
        match task {
            HealthPollCommand::PollNow => self.poll_blocking().await,
        }
    }

    async fn on_tick(&mut self) {
        self.poll_blocking().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::health::checks::FnHealthCheck;
    use crate::health::helper::{invoke, invoke_by_id, invoke_readiness, HealthContext};

    #[tokio::test]
    async fn helper_prefers_cached_results() {
        let registry = Arc::new(HealthCheckRegistry::new());
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&healthy);
        registry.register(Arc::new(FnHealthCheck::new("toggle", move |_| {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(anyhow::anyhow!("switched off"))
            }
        })));

        let service = Arc::new(PollingHealthCheckService::new(
            registry.clone(),
            Duration::from_secs(3600),
        ));
        service.start().await;

        let ctx = HealthContext::new(
            Some(registry),
            Some(service.clone() as Arc<dyn HealthCheckService>),
        );
        assert!(invoke(&ctx)[0].is_up());

        healthy.store(false, Ordering::SeqCst);
        // Still the cached result until the next poll.
        assert!(invoke(&ctx)[0].is_up());
        // By-id calls evaluate immediately.
        assert!(invoke_by_id(&ctx, "toggle", &HealthOptions::new())
            .unwrap()
            .is_down());

        service.refresh();
        assert!(invoke(&ctx)[0].is_down());
        assert_eq!(invoke_readiness(&ctx).len(), 1);

        service.stop().await;
    }

    #[tokio::test]
    async fn poll_now_notifies_listener() {
        let registry = Arc::new(HealthCheckRegistry::new());
        registry.register(Arc::new(FnHealthCheck::new("a", |_| Ok(()))));
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let service = PollingHealthCheckService::new(registry, Duration::from_secs(3600))
            .with_listener(Arc::new(move |results: &[CachedResult]| {
                assert_eq!(results.len(), 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        assert!(service.poll_now().await.is_err());
        service.start().await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        service.poll_now().await.unwrap();
        for _ in 0..50 {
            if polls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        service.stop().await;
    }
}
