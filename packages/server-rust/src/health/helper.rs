//! Invocation of health checks across a registry or a push service.
//!
//! A [`HealthContext`] names the sources explicitly: the helper never
//! consults process-wide state. When a [`HealthCheckService`] is present
//! its cached results are authoritative; otherwise checks are evaluated
//! synchronously from the registry.

use std::sync::Arc;

use camber_core::{HealthCheck, HealthCheckResult, HealthOptions, HealthState};
use tracing::debug;

use super::registry::HealthCheckRegistry;
use super::service::HealthCheckService;

/// Health sources available to the helper.
#[derive(Clone, Default)]
pub struct HealthContext {
    pub registry: Option<Arc<HealthCheckRegistry>>,
    pub service: Option<Arc<dyn HealthCheckService>>,
}

impl HealthContext {
    #[must_use]
    pub fn new(
        registry: Option<Arc<HealthCheckRegistry>>,
        service: Option<Arc<dyn HealthCheckService>>,
    ) -> Self {
        Self { registry, service }
    }

    #[must_use]
    pub fn with_registry(registry: Arc<HealthCheckRegistry>) -> Self {
        Self {
            registry: Some(registry),
            service: None,
        }
    }
}

impl std::fmt::Debug for HealthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthContext")
            .field("registry", &self.registry)
            .field("service", &self.service.is_some())
            .finish()
    }
}

/// Checks the registry would evaluate, in execution order.
///
/// Checks are grouped by group (checks without one share the default
/// group, groups in first-seen order) and flattened; excluded and disabled
/// checks and those rejected by `filter` are dropped; the rest are
/// stable-sorted by ascending `order`, so ties keep discovery order.
pub fn ordered_checks<P>(registry: &HealthCheckRegistry, filter: P) -> Vec<Arc<dyn HealthCheck>>
where
    P: Fn(&dyn HealthCheck) -> bool,
{
    if !registry.is_enabled() {
        return Vec::new();
    }

    let mut groups: Vec<(String, Vec<Arc<dyn HealthCheck>>)> = Vec::new();
    for check in registry.checks() {
        let group = check.group().unwrap_or_default().to_string();
        match groups.iter_mut().find(|(name, _)| *name == group) {
            Some((_, members)) => members.push(check),
            None => groups.push((group, vec![check])),
        }
    }

    let mut checks: Vec<Arc<dyn HealthCheck>> = groups
        .into_iter()
        .flat_map(|(_, members)| members)
        .filter(|c| !registry.is_excluded(c.as_ref()))
        .filter(|c| c.is_enabled())
        .filter(|c| filter(c.as_ref()))
        .collect();
    checks.sort_by_key(|c| c.order());
    checks
}

/// Invokes every check accepted by `filter`, passing each the options
/// produced by `options_for`.
///
/// Returns an empty list when the context has no source.
pub fn invoke_with<F, P>(ctx: &HealthContext, options_for: F, filter: P) -> Vec<HealthCheckResult>
where
    F: Fn(&dyn HealthCheck) -> HealthOptions,
    P: Fn(&dyn HealthCheck) -> bool,
{
    if let Some(service) = &ctx.service {
        return service
            .results()
            .into_iter()
            .filter(|(check, _)| filter(check.as_ref()))
            .map(|(_, result)| result)
            .collect();
    }
    let Some(registry) = &ctx.registry else {
        debug!("no health check registry or service available");
        return Vec::new();
    };
    ordered_checks(registry, filter)
        .into_iter()
        .map(|check| check.call(&options_for(check.as_ref())))
        .collect()
}

/// Invokes all checks with empty options.
pub fn invoke(ctx: &HealthContext) -> Vec<HealthCheckResult> {
    invoke_with(ctx, |_| HealthOptions::new(), |_| true)
}

/// Invokes the checks that participate in liveness.
pub fn invoke_liveness(ctx: &HealthContext) -> Vec<HealthCheckResult> {
    invoke_with(ctx, |_| HealthOptions::new(), |c| c.is_liveness())
}

/// Invokes the checks that participate in readiness.
pub fn invoke_readiness(ctx: &HealthContext) -> Vec<HealthCheckResult> {
    invoke_with(ctx, |_| HealthOptions::new(), |c| c.is_readiness())
}

/// Invokes a single check by id.
///
/// Returns `None` if no source is available or the id is unknown.
pub fn invoke_by_id(
    ctx: &HealthContext,
    id: &str,
    options: &HealthOptions,
) -> Option<HealthCheckResult> {
    if let Some(service) = &ctx.service {
        return service.call(id, options);
    }
    if let Some(registry) = &ctx.registry {
        return registry.get_check(id).map(|check| check.call(options));
    }
    debug!(check = id, "no health check registry or service available");
    None
}

/// Aggregate status of `results`.
///
/// Readiness requires every result to be `Up`; liveness only requires that
/// none is `Down`, so `Unknown` results do not fail a liveness probe.
#[must_use]
pub fn is_results_up(results: &[HealthCheckResult], readiness: bool) -> bool {
    if readiness {
        results.iter().all(|r| r.state == HealthState::Up)
    } else {
        results.iter().all(|r| r.state != HealthState::Down)
    }
}
