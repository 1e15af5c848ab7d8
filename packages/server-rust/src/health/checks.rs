//! Built-in health checks.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use camber_core::unit::now_millis;
use camber_core::{HealthCheck, HealthCheckResult, HealthOptions, HealthState};

use crate::aggregation::AggregationStore;
use crate::service::shutdown::{LifecycleState, ShutdownController};

pub const INVOCATION_COUNT: &str = "invocation.count";
pub const SUCCESS_COUNT: &str = "success.count";
pub const FAILURE_COUNT: &str = "failure.count";
pub const INVOCATION_TIME: &str = "invocation.time";

/// Identity, flags and invocation counters shared by the built-in checks.
#[derive(Debug)]
struct CheckMeta {
    id: String,
    group: Option<String>,
    order: i32,
    enabled: AtomicBool,
    readiness: bool,
    liveness: bool,
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    last_invocation: AtomicI64,
}

impl CheckMeta {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: None,
            order: i32::MAX,
            enabled: AtomicBool::new(true),
            readiness: true,
            liveness: true,
            invocations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_invocation: AtomicI64::new(0),
        }
    }

    /// Counts the invocation and attaches the counters as details.
    fn finish(&self, mut result: HealthCheckResult) -> HealthCheckResult {
        let now = now_millis();
        self.last_invocation.store(now, Ordering::Relaxed);
        let invocations = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        match result.state {
            HealthState::Up => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            HealthState::Down => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            HealthState::Unknown => {}
        }
        let details = &mut result.details;
        details.insert(INVOCATION_COUNT.to_string(), invocations.into());
        details.insert(
            SUCCESS_COUNT.to_string(),
            self.successes.load(Ordering::Relaxed).into(),
        );
        details.insert(
            FAILURE_COUNT.to_string(),
            self.failures.load(Ordering::Relaxed).into(),
        );
        details.insert(INVOCATION_TIME.to_string(), now.into());
        result
    }
}

macro_rules! delegate_check_meta {
    () => {
        fn id(&self) -> &str {
            &self.meta.id
        }

        fn group(&self) -> Option<&str> {
            self.meta.group.as_deref()
        }

        fn order(&self) -> i32 {
            self.meta.order
        }

        fn is_enabled(&self) -> bool {
            self.meta.enabled.load(Ordering::Relaxed)
        }

        fn set_enabled(&self, enabled: bool) {
            self.meta.enabled.store(enabled, Ordering::Relaxed);
        }

        fn is_readiness(&self) -> bool {
            self.meta.readiness
        }

        fn is_liveness(&self) -> bool {
            self.meta.liveness
        }
    };
}

type Probe = dyn Fn(&HealthOptions) -> anyhow::Result<()> + Send + Sync;

/// Check backed by a closure.
///
/// `Ok(())` reports `Up`; an error reports `Down` with the flattened cause
/// chain.
pub struct FnHealthCheck {
    meta: CheckMeta,
    probe: Box<Probe>,
}

impl FnHealthCheck {
    pub fn new<F>(id: impl Into<String>, probe: F) -> Self
    where
        F: Fn(&HealthOptions) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            meta: CheckMeta::new(id),
            probe: Box::new(probe),
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.meta.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: i32) -> Self {
        self.meta.order = order;
        self
    }

    #[must_use]
    pub fn readiness(mut self, readiness: bool) -> Self {
        self.meta.readiness = readiness;
        self
    }

    #[must_use]
    pub fn liveness(mut self, liveness: bool) -> Self {
        self.meta.liveness = liveness;
        self
    }
}

impl HealthCheck for FnHealthCheck {
    delegate_check_meta!();

    fn call(&self, options: &HealthOptions) -> HealthCheckResult {
        let builder = HealthCheckResult::builder(self);
        let builder = match (self.probe)(options) {
            Ok(()) => builder.up(),
            Err(e) => builder.down().error(&e),
        };
        self.meta.finish(builder.build())
    }
}

/// Pings the storage backend of an aggregation store and reports how many
/// completed aggregates await confirmation.
pub struct AggregationStoreHealthCheck {
    meta: CheckMeta,
    store: Arc<AggregationStore>,
}

impl AggregationStoreHealthCheck {
    #[must_use]
    pub fn new(store: Arc<AggregationStore>) -> Self {
        let mut meta = CheckMeta::new(format!("aggregation-{}", store.map_name()));
        meta.group = Some("storage".to_string());
        Self { meta, store }
    }

    fn probe(&self) -> anyhow::Result<(usize, usize)> {
        let engine = self.store.engine();
        engine
            .ping()
            .with_context(|| format!("{} backend did not respond", engine.name()))?;
        let live = engine.len(self.store.map_name())?;
        let pending = self.store.pending_recovery_count()?;
        Ok((live, pending))
    }
}

impl HealthCheck for AggregationStoreHealthCheck {
    delegate_check_meta!();

    fn call(&self, _options: &HealthOptions) -> HealthCheckResult {
        let builder = HealthCheckResult::builder(self)
            .detail("backend", self.store.engine().name())
            .detail("map", self.store.map_name());
        let result = match self.probe() {
            Ok((live, pending)) => builder
                .up()
                .detail("live.count", live)
                .detail("pending.recovery", pending),
            Err(e) => builder.down().error(&e),
        };
        self.meta.finish(result.build())
    }
}

/// Reports `Up` only while the process lifecycle is `Ready`.
///
/// Participates in readiness only; a draining process is still alive.
pub struct LifecycleHealthCheck {
    meta: CheckMeta,
    controller: Arc<ShutdownController>,
}

impl LifecycleHealthCheck {
    #[must_use]
    pub fn new(controller: Arc<ShutdownController>) -> Self {
        let mut meta = CheckMeta::new("lifecycle");
        meta.order = 0;
        meta.liveness = false;
        Self { meta, controller }
    }
}

impl HealthCheck for LifecycleHealthCheck {
    delegate_check_meta!();

    fn call(&self, _options: &HealthOptions) -> HealthCheckResult {
        let state = self.controller.state();
        let builder = HealthCheckResult::builder(self).detail("state", state.as_str());
        let builder = if state == LifecycleState::Ready {
            builder.up()
        } else {
            builder.down().message(format!("lifecycle is {}", state.as_str()))
        };
        self.meta.finish(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use camber_core::Value;

    use super::*;
    use crate::aggregation::AggregationConfig;
    use crate::storage::engines::HashMapStorage;
    use crate::storage::StorageEngine;

    #[test]
    fn fn_check_counts_invocations() {
        let check = FnHealthCheck::new("flaky", |options: &HealthOptions| {
            if options.contains_key("fail") {
                Err(anyhow::anyhow!("socket closed")).context("probe failed")
            } else {
                Ok(())
            }
        });

        let up = check.call(&HealthOptions::new());
        assert!(up.is_up());
        assert_eq!(up.details[INVOCATION_COUNT], Value::Int(1));
        assert_eq!(up.details[SUCCESS_COUNT], Value::Int(1));

        let mut options = HealthOptions::new();
        options.insert("fail".to_string(), Value::Bool(true));
        let down = check.call(&options);
        assert!(down.is_down());
        assert_eq!(
            down.error.as_deref(),
            Some("probe failed; Caused by: socket closed")
        );
        assert_eq!(down.details[INVOCATION_COUNT], Value::Int(2));
        assert_eq!(down.details[FAILURE_COUNT], Value::Int(1));
        assert!(down.details.contains_key(INVOCATION_TIME));
    }

    #[test]
    fn fn_check_builder_options() {
        let check = FnHealthCheck::new("c", |_| Ok(()))
            .with_group("routes")
            .with_order(3)
            .liveness(false);
        assert_eq!(check.group(), Some("routes"));
        assert_eq!(check.order(), 3);
        assert!(check.is_readiness());
        assert!(!check.is_liveness());
        check.set_enabled(false);
        assert!(!check.is_enabled());
    }

    #[test]
    fn store_check_reports_pending_recovery() {
        let engine = Arc::new(HashMapStorage::new());
        let config = AggregationConfig::builder("agg").build().unwrap();
        let store = Arc::new(AggregationStore::new(engine.clone(), config));
        let unit = camber_core::CorrelatedUnit::builder("order-42").build();
        store.add("order-42", &unit).unwrap();
        store.remove("order-42", &unit).unwrap();

        let check = AggregationStoreHealthCheck::new(store);
        assert_eq!(check.id(), "aggregation-agg");
        let result = check.call(&HealthOptions::new());
        assert!(result.is_up());
        assert_eq!(result.details["pending.recovery"], Value::Int(1));
        assert_eq!(result.details["live.count"], Value::Int(0));

        engine.close().unwrap();
        let result = check.call(&HealthOptions::new());
        assert!(result.is_down());
        assert!(result.error.unwrap().contains("memory backend did not respond"));
    }

    #[test]
    fn lifecycle_check_follows_controller() {
        let controller = Arc::new(ShutdownController::new());
        let check = LifecycleHealthCheck::new(controller.clone());
        assert!(!check.is_liveness());

        let starting = check.call(&HealthOptions::new());
        assert!(starting.is_down());
        assert_eq!(starting.message.as_deref(), Some("lifecycle is starting"));

        controller.set_ready();
        assert!(check.call(&HealthOptions::new()).is_up());

        controller.trigger_shutdown();
        assert!(check.call(&HealthOptions::new()).is_down());
    }
}
