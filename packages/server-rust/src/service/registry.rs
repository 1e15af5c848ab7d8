use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error};

use super::config::ServerConfig;
use super::shutdown::ShutdownController;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context provided to services during initialization.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<ServerConfig>,
    pub shutdown: Arc<ShutdownController>,
}

impl ServiceContext {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed service. All domain services implement this.
///
/// Services are initialized in registration order and shut down in reverse
/// registration order. The `Any` bound enables type-based lookup via
/// [`ServiceRegistry::get`].
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Unique name of this service (e.g. `"aggregation"`).
    fn name(&self) -> &'static str;

    /// Acquire resources and start background work.
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Drop transient state without releasing resources.
    async fn reset(&self) -> anyhow::Result<()>;

    /// Stop background work and release resources. `terminate` marks a
    /// forced stop after a failed drain.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry of lifecycle-managed services, addressable by name or type.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    init_order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a service and returns a typed handle to it.
    ///
    /// Registering a second service under an existing name replaces the
    /// lookup entries but keeps the original position in the init order.
    pub fn register<T: ManagedService>(&self, service: T) -> Arc<T> {
        let name = service.name();
        let arc = Arc::new(service);
        let replaced = self
            .by_name
            .insert(name, arc.clone() as Arc<dyn ManagedService>)
            .is_some();
        self.by_type
            .insert(TypeId::of::<T>(), arc.clone() as Arc<dyn Any + Send + Sync>);
        if !replaced {
            self.init_order.write().push(name);
        }
        arc
    }

    /// Retrieve a service by its concrete type.
    #[must_use]
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Service names in init order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.init_order.read().clone()
    }

    /// Initialize all services in registration order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the failing service's error.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        for name in self.names() {
            if let Some(service) = self.get_by_name(name) {
                debug!(service = name, "initializing service");
                service
                    .init(ctx)
                    .await
                    .map_err(|e| e.context(format!("failed to initialize {name}")))?;
            }
        }
        Ok(())
    }

    /// Shut down all services in reverse registration order.
    ///
    /// Every service is asked to stop even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error encountered.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let mut first_error = None;
        for name in self.names().into_iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                debug!(service = name, terminate, "shutting down service");
                if let Err(e) = service.shutdown(terminate).await {
                    error!(service = name, error = %e, "service shutdown failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Records lifecycle calls into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_shutdown: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail_shutdown: false,
            }
        }
    }

    #[async_trait]
    impl ManagedService for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.log.lock().push(format!("init:{}", self.name));
            Ok(())
        }

        async fn reset(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.log.lock().push(format!("shutdown:{}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ManagedService for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            anyhow::bail!("backend unreachable")
        }
        async fn reset(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn ctx() -> ServiceContext {
        ServiceContext::new(ServerConfig::default())
    }

    #[test]
    fn lookup_by_name_and_type() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        let handle = registry.register(Recorder::new("aggregation", &log));
        registry.register(Failing);

        assert_eq!(handle.name(), "aggregation");
        assert_eq!(registry.get_by_name("aggregation").unwrap().name(), "aggregation");
        assert!(registry.get::<Failing>().is_some());
        assert!(registry.get_by_name("missing").is_none());
        assert_eq!(registry.names(), vec!["aggregation", "failing"]);
    }

    #[tokio::test]
    async fn init_forward_shutdown_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(Recorder::new("storage", &log));
        registry.register(Recorder::new("aggregation", &log));
        registry.register(Recorder::new("health", &log));

        registry.init_all(&ctx()).await.unwrap();
        registry.shutdown_all(false).await.unwrap();

        assert_eq!(
            log.lock().clone(),
            vec![
                "init:storage",
                "init:aggregation",
                "init:health",
                "shutdown:health",
                "shutdown:aggregation",
                "shutdown:storage",
            ]
        );
    }

    #[tokio::test]
    async fn init_failure_names_service() {
        let registry = ServiceRegistry::new();
        registry.register(Failing);
        let err = registry.init_all(&ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to initialize failing");
    }

    #[tokio::test]
    async fn shutdown_continues_after_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(Recorder::new("first", &log));
        let mut stubborn = Recorder::new("second", &log);
        stubborn.fail_shutdown = true;
        registry.register(stubborn);

        let err = registry.shutdown_all(true).await.unwrap_err();
        assert_eq!(err.to_string(), "second refused to stop");
        assert_eq!(
            log.lock().clone(),
            vec!["shutdown:second", "shutdown:first"]
        );
    }
}
