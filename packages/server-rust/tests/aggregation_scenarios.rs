//! End-to-end scenarios across the aggregation store, recovery and health
//! registry.

use std::sync::Arc;
use std::time::Duration;

use camber_core::{CorrelatedUnit, HealthState};
use camber_server::aggregation::{
    retry_on_conflict, AggregationConfig, AggregationError, AggregationStore,
    OptimisticLockRetryPolicy,
};
use camber_server::health::{
    invoke, invoke_by_id, AggregationStoreHealthCheck, FnHealthCheck, HealthCheckRegistry,
    HealthContext,
};
use camber_server::storage::{BackendConfig, StorageFactory};

fn memory_store(optimistic: bool, use_recovery: bool) -> AggregationStore {
    let config = AggregationConfig::builder("agg")
        .optimistic(optimistic)
        .use_recovery(use_recovery)
        .build()
        .unwrap();
    let engine = StorageFactory::new(BackendConfig::Memory).open().unwrap();
    AggregationStore::new(engine, config)
}

fn snapshot(key: &str, body: &str) -> CorrelatedUnit {
    CorrelatedUnit::builder(key)
        .header("source", "orders")
        .body(body)
        .build()
}

#[test]
fn pessimistic_add_replaces_and_returns_previous() {
    let store = memory_store(false, true);
    let a = snapshot("order-42", "A");
    let b = snapshot("order-42", "B");

    assert!(store.add("order-42", &a).unwrap().is_none());
    assert_eq!(store.get("order-42").unwrap(), Some(a.clone()));

    let old = store.add("order-42", &b).unwrap();
    assert_eq!(old, Some(a));
    assert_eq!(store.get("order-42").unwrap(), Some(b));
}

#[test]
fn optimistic_insert_twice_conflicts() {
    let store = memory_store(true, true);
    let u1 = snapshot("k", "first");

    store.add_if("k", None, &u1).unwrap();
    let err = store.add_if("k", None, &snapshot("k", "second")).unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.get("k").unwrap(), Some(u1));
}

#[test]
fn optimistic_remove_of_stale_unit_leaves_store_unchanged() {
    let store = memory_store(true, true);
    let original = snapshot("k", "v1");
    let replacement = snapshot("k", "v2");
    store.add_if("k", None, &original).unwrap();
    store.add_if("k", Some(&original), &replacement).unwrap();

    let err = store.remove("k", &original).unwrap_err();
    assert!(matches!(err, AggregationError::OptimisticLockConflict { .. }));
    assert_eq!(store.get("k").unwrap(), Some(replacement));
    assert!(store.scan().unwrap().is_empty());
}

#[test]
fn remove_archives_until_confirmed() {
    for optimistic in [false, true] {
        let store = memory_store(optimistic, true);
        let unit = snapshot("order-7", "done");
        if optimistic {
            store.add_if("order-7", None, &unit).unwrap();
        } else {
            store.add("order-7", &unit).unwrap();
        }

        store.remove("order-7", &unit).unwrap();
        assert!(store.get("order-7").unwrap().is_none());
        assert!(store.scan().unwrap().contains(&unit.unit_id));
        assert_eq!(store.recover(&unit.unit_id).unwrap(), Some(unit.clone()));

        assert!(store.confirm(&unit.unit_id).unwrap());
        assert!(!store.scan().unwrap().contains(&unit.unit_id));
        assert!(store.recover(&unit.unit_id).unwrap().is_none());
    }
}

#[test]
fn recovery_disabled_scan_is_always_empty() {
    let store = memory_store(false, false);
    for i in 0..5 {
        let key = format!("k{i}");
        let unit = snapshot(&key, "x");
        store.add(&key, &unit).unwrap();
        store.remove(&key, &unit).unwrap();
    }
    assert!(store.scan().unwrap().is_empty());
    assert_eq!(store.pending_recovery_count().unwrap(), 0);
}

#[test]
fn health_invoke_sorts_by_order_and_resolves_by_id() {
    let registry = Arc::new(HealthCheckRegistry::new());
    for (id, order) in [("five", 5), ("one", 1), ("three", 3)] {
        registry.register(Arc::new(FnHealthCheck::new(id, |_| Ok(())).with_order(order)));
    }
    let ctx = HealthContext::with_registry(Arc::clone(&registry));

    let ids: Vec<_> = invoke(&ctx).into_iter().map(|r| r.check_id).collect();
    assert_eq!(ids, vec!["one", "three", "five"]);

    let single = invoke_by_id(&ctx, "three", &Default::default()).unwrap();
    assert_eq!(single.state, HealthState::Up);
    assert!(invoke_by_id(&HealthContext::default(), "three", &Default::default()).is_none());
}

#[test]
fn store_health_reports_pending_recovery() {
    let store = Arc::new(memory_store(false, true));
    let unit = snapshot("k", "v");
    store.add("k", &unit).unwrap();
    store.remove("k", &unit).unwrap();

    let registry = Arc::new(HealthCheckRegistry::new());
    registry.register(Arc::new(AggregationStoreHealthCheck::new(Arc::clone(&store))));
    let results = invoke(&HealthContext::with_registry(registry));

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, HealthState::Up);
    assert_eq!(
        results[0].details.get("pending.recovery").and_then(|v| v.as_int()),
        Some(1)
    );

    store.engine().close().unwrap();
    let registry = Arc::new(HealthCheckRegistry::new());
    registry.register(Arc::new(AggregationStoreHealthCheck::new(store)));
    let results = invoke(&HealthContext::with_registry(registry));
    assert_eq!(results[0].state, HealthState::Down);
}

#[cfg(feature = "redb")]
#[test]
fn pending_recovery_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = BackendConfig::Redb {
        path: dir.path().join("agg.redb"),
    };
    let config = AggregationConfig::builder("agg").build().unwrap();
    let unit = snapshot("order-42", "A");

    {
        let engine = StorageFactory::new(backend.clone()).open().unwrap();
        let store = AggregationStore::new(engine, config.clone());
        store.add("order-42", &unit).unwrap();
        store.remove("order-42", &unit).unwrap();
    }

    let engine = StorageFactory::new(backend).open().unwrap();
    let store = AggregationStore::new(engine, config);
    assert_eq!(store.scan().unwrap().into_iter().collect::<Vec<_>>(), vec![
        unit.unit_id.clone()
    ]);
    assert_eq!(store.recover(&unit.unit_id).unwrap(), Some(unit));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_optimistic_writers_converge_with_retry() {
    const WRITERS: i64 = 8;
    let store = Arc::new(memory_store(true, false));
    let policy = OptimisticLockRetryPolicy {
        retry_delay: Duration::from_millis(1),
        maximum_retry_delay: Duration::from_millis(5),
        exponential_backoff: false,
        random_backoff: true,
        ..OptimisticLockRetryPolicy::default()
    };

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let store = Arc::clone(&store);
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            retry_on_conflict(&policy, |_attempt| {
                let store = Arc::clone(&store);
                async move {
                    let current = store.get("counter")?;
                    let next = match &current {
                        Some(unit) => {
                            let mut next = unit.clone();
                            let count = unit.header("count").and_then(|v| v.as_int()).unwrap_or(0);
                            next.set_header("count", count + 1);
                            next
                        }
                        None => CorrelatedUnit::builder("counter").header("count", 1_i64).build(),
                    };
                    store.add_if("counter", current.as_ref(), &next)
                }
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let total = store
        .get("counter")
        .unwrap()
        .and_then(|u| u.header("count").and_then(|v| v.as_int()));
    assert_eq!(total, Some(WRITERS));
}
