//! Registry of health checks and check repositories.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camber_core::HealthCheck;
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

/// A source of health checks discovered as a unit.
pub trait HealthCheckRepository: Send + Sync {
    fn id(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Checks provided by this repository, in discovery order.
    fn checks(&self) -> Vec<Arc<dyn HealthCheck>>;
}

/// Repository over a fixed list of checks.
pub struct StaticHealthCheckRepository {
    id: String,
    enabled: AtomicBool,
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl StaticHealthCheckRepository {
    #[must_use]
    pub fn new(id: impl Into<String>, checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            checks,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl HealthCheckRepository for StaticHealthCheckRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn checks(&self) -> Vec<Arc<dyn HealthCheck>> {
        self.checks.clone()
    }
}

/// How much detail a rendered health report exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExposureLevel {
    /// Overall status only.
    Oneline,
    /// Overall status plus the checks that are down.
    #[default]
    Default,
    /// Every check including error details.
    Full,
}

impl ExposureLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oneline => "oneline",
            Self::Default => "default",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for ExposureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown exposure level {0:?} (expected oneline, default or full)")]
pub struct ParseExposureLevelError(String);

impl FromStr for ExposureLevel {
    type Err = ParseExposureLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oneline" => Ok(Self::Oneline),
            "default" => Ok(Self::Default),
            "full" => Ok(Self::Full),
            _ => Err(ParseExposureLevelError(s.to_string())),
        }
    }
}

/// One comma-separated token of an exclusion pattern.
#[derive(Debug)]
struct ExcludeRule {
    token: String,
    wildcard: Regex,
    regex: Option<Regex>,
}

impl ExcludeRule {
    fn new(token: &str) -> Option<Self> {
        let escaped = regex::escape(token).replace(r"\*", ".*");
        let wildcard = Regex::new(&format!("^{escaped}$")).ok()?;
        let regex = Regex::new(&format!("^(?:{token})$")).ok();
        Some(Self {
            token: token.to_string(),
            wildcard,
            regex,
        })
    }

    fn matches(&self, candidate: &str) -> bool {
        candidate == self.token
            || self.wildcard.is_match(candidate)
            || self.regex.as_ref().is_some_and(|r| r.is_match(candidate))
    }
}

/// Registry of health checks and repositories.
///
/// Checks registered directly come first in discovery order, followed by
/// the checks of each enabled repository in attachment order. A check id
/// seen twice is reported once.
pub struct HealthCheckRegistry {
    enabled: AtomicBool,
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    repositories: RwLock<Vec<Arc<dyn HealthCheckRepository>>>,
    exclude_pattern: RwLock<Option<String>>,
    exclude_rules: RwLock<Vec<ExcludeRule>>,
    exposure_level: RwLock<ExposureLevel>,
}

impl fmt::Debug for HealthCheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckRegistry")
            .field("enabled", &self.is_enabled())
            .field("checks", &self.get_check_ids())
            .field("exclude_pattern", &*self.exclude_pattern.read())
            .field("exposure_level", &self.exposure_level())
            .finish_non_exhaustive()
    }
}

impl HealthCheckRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            checks: RwLock::new(Vec::new()),
            repositories: RwLock::new(Vec::new()),
            exclude_pattern: RwLock::new(None),
            exclude_rules: RwLock::new(Vec::new()),
            exposure_level: RwLock::new(ExposureLevel::default()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Registers a check. Returns `false` if a check with the same id is
    /// already registered.
    pub fn register(&self, check: Arc<dyn HealthCheck>) -> bool {
        let mut checks = self.checks.write();
        if checks.iter().any(|c| c.id() == check.id()) {
            return false;
        }
        debug!(check = check.id(), "registered health check");
        checks.push(check);
        true
    }

    /// Unregisters a check by id. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        let mut checks = self.checks.write();
        let before = checks.len();
        checks.retain(|c| c.id() != id);
        checks.len() != before
    }

    /// Attaches a repository. Returns `false` if one with the same id is
    /// already attached.
    pub fn add_repository(&self, repository: Arc<dyn HealthCheckRepository>) -> bool {
        let mut repositories = self.repositories.write();
        if repositories.iter().any(|r| r.id() == repository.id()) {
            return false;
        }
        repositories.push(repository);
        true
    }

    pub fn remove_repository(&self, id: &str) -> bool {
        let mut repositories = self.repositories.write();
        let before = repositories.len();
        repositories.retain(|r| r.id() != id);
        repositories.len() != before
    }

    #[must_use]
    pub fn get_repository(&self, id: &str) -> Option<Arc<dyn HealthCheckRepository>> {
        self.repositories
            .read()
            .iter()
            .find(|r| r.id() == id)
            .cloned()
    }

    /// Looks up a check by id across registered checks and enabled
    /// repositories.
    #[must_use]
    pub fn get_check(&self, id: &str) -> Option<Arc<dyn HealthCheck>> {
        self.checks().into_iter().find(|c| c.id() == id)
    }

    #[must_use]
    pub fn get_check_ids(&self) -> Vec<String> {
        self.checks().iter().map(|c| c.id().to_string()).collect()
    }

    /// Every known check in discovery order.
    #[must_use]
    pub fn checks(&self) -> Vec<Arc<dyn HealthCheck>> {
        let mut all: Vec<Arc<dyn HealthCheck>> = self.checks.read().clone();
        let repositories = self.repositories.read().clone();
        for repository in repositories.iter().filter(|r| r.is_enabled()) {
            for check in repository.checks() {
                if !all.iter().any(|c| c.id() == check.id()) {
                    all.push(check);
                }
            }
        }
        all
    }

    /// Sets the exclusion pattern: comma-separated tokens, each an exact
    /// id, a `*` wildcard, or a regular expression.
    pub fn set_exclude_pattern(&self, pattern: Option<&str>) {
        let pattern = pattern.map(str::trim).filter(|p| !p.is_empty());
        let rules = pattern
            .map(|p| {
                p.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .filter_map(ExcludeRule::new)
                    .collect()
            })
            .unwrap_or_default();
        *self.exclude_rules.write() = rules;
        *self.exclude_pattern.write() = pattern.map(str::to_string);
    }

    #[must_use]
    pub fn exclude_pattern(&self) -> Option<String> {
        self.exclude_pattern.read().clone()
    }

    /// Whether `check` matches the exclusion pattern by `id` or `group/id`.
    #[must_use]
    pub fn is_excluded(&self, check: &dyn HealthCheck) -> bool {
        let rules = self.exclude_rules.read();
        if rules.is_empty() {
            return false;
        }
        let qualified = check.group().map(|g| format!("{g}/{}", check.id()));
        rules.iter().any(|rule| {
            rule.matches(check.id()) || qualified.as_deref().is_some_and(|q| rule.matches(q))
        })
    }

    #[must_use]
    pub fn exposure_level(&self) -> ExposureLevel {
        *self.exposure_level.read()
    }

    pub fn set_exposure_level(&self, level: ExposureLevel) {
        *self.exposure_level.write() = level;
    }
}

impl Default for HealthCheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::checks::FnHealthCheck;

    fn check(id: &str) -> Arc<dyn HealthCheck> {
        Arc::new(FnHealthCheck::new(id, |_| Ok(())))
    }

    fn grouped(group: &str, id: &str) -> Arc<dyn HealthCheck> {
        Arc::new(FnHealthCheck::new(id, |_| Ok(())).with_group(group))
    }

    #[test]
    fn register_and_unregister_report_changes() {
        let registry = HealthCheckRegistry::new();
        assert!(registry.register(check("a")));
        assert!(!registry.register(check("a")));
        assert!(registry.get_check("a").is_some());

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get_check("a").is_none());
    }

    #[test]
    fn repositories_contribute_checks_after_registered_ones() {
        let registry = HealthCheckRegistry::new();
        registry.register(check("direct"));
        let repo = Arc::new(StaticHealthCheckRepository::new(
            "repo",
            vec![check("from-repo"), check("direct")],
        ));
        assert!(registry.add_repository(repo.clone()));
        assert!(!registry.add_repository(repo.clone()));

        assert_eq!(registry.get_check_ids(), vec!["direct", "from-repo"]);
        assert!(registry.get_check("from-repo").is_some());

        repo.set_enabled(false);
        assert_eq!(registry.get_check_ids(), vec!["direct"]);

        repo.set_enabled(true);
        assert!(registry.remove_repository("repo"));
        assert!(registry.get_repository("repo").is_none());
        assert_eq!(registry.get_check_ids(), vec!["direct"]);
    }

    #[test]
    fn exclusion_by_id_wildcard_and_group() {
        let registry = HealthCheckRegistry::new();
        registry.set_exclude_pattern(Some("store-*, routes/slow"));

        assert!(registry.is_excluded(check("store-agg").as_ref()));
        assert!(!registry.is_excluded(check("lifecycle").as_ref()));
        assert!(registry.is_excluded(grouped("routes", "slow").as_ref()));
        assert!(!registry.is_excluded(grouped("other", "slow").as_ref()));
        assert_eq!(
            registry.exclude_pattern().as_deref(),
            Some("store-*, routes/slow")
        );

        registry.set_exclude_pattern(None);
        assert!(!registry.is_excluded(check("store-agg").as_ref()));
    }

    #[test]
    fn exclusion_accepts_regex() {
        let registry = HealthCheckRegistry::new();
        registry.set_exclude_pattern(Some("db-[0-9]+"));
        assert!(registry.is_excluded(check("db-12").as_ref()));
        assert!(!registry.is_excluded(check("db-x").as_ref()));
    }

    #[test]
    fn exposure_level_parses() {
        assert_eq!("FULL".parse::<ExposureLevel>().unwrap(), ExposureLevel::Full);
        assert_eq!(
            "oneline".parse::<ExposureLevel>().unwrap(),
            ExposureLevel::Oneline
        );
        assert!("verbose".parse::<ExposureLevel>().is_err());

        let registry = HealthCheckRegistry::new();
        assert_eq!(registry.exposure_level(), ExposureLevel::Default);
        registry.set_exposure_level(ExposureLevel::Full);
        assert_eq!(registry.exposure_level().to_string(), "full");
    }
}
