//! Health-check vocabulary shared by registries, services and probes.
//!
//! A [`HealthCheck`] is a named, orderable probe. Invoking it never fails:
//! problems are reported inside the returned [`HealthCheckResult`], so a
//! registry can evaluate many checks without any one of them aborting the
//! sweep.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Caller-supplied options passed to a single check invocation.
pub type HealthOptions = BTreeMap<String, Value>;

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Up,
    Down,
    Unknown,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result produced by one invocation of a [`HealthCheck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Id of the check that produced this result.
    pub check_id: String,
    /// Group of the check, if any.
    pub group: Option<String>,
    pub state: HealthState,
    /// Optional human-readable message.
    pub message: Option<String>,
    /// Error text (the full cause chain) when the probe failed.
    pub error: Option<String>,
    /// Diagnostic details, e.g. invocation counters.
    pub details: BTreeMap<String, Value>,
}

impl HealthCheckResult {
    /// Starts a result for the given check in the `Unknown` state.
    #[must_use]
    pub fn builder(check: &dyn HealthCheck) -> HealthCheckResultBuilder {
        HealthCheckResultBuilder {
            result: Self {
                check_id: check.id().to_string(),
                group: check.group().map(str::to_string),
                state: HealthState::Unknown,
                message: None,
                error: None,
                details: BTreeMap::new(),
            },
        }
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state == HealthState::Up
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.state == HealthState::Down
    }
}

/// Builder for [`HealthCheckResult`].
#[derive(Debug)]
pub struct HealthCheckResultBuilder {
    result: HealthCheckResult,
}

impl HealthCheckResultBuilder {
    #[must_use]
    pub fn up(mut self) -> Self {
        self.result.state = HealthState::Up;
        self
    }

    #[must_use]
    pub fn down(mut self) -> Self {
        self.result.state = HealthState::Down;
        self
    }

    #[must_use]
    pub fn unknown(mut self) -> Self {
        self.result.state = HealthState::Unknown;
        self
    }

    #[must_use]
    pub fn state(mut self, state: HealthState) -> Self {
        self.result.state = state;
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.result.message = Some(message.into());
        self
    }

    /// Records an error, flattening its cause chain into one line.
    #[must_use]
    pub fn error(mut self, error: &anyhow::Error) -> Self {
        let chain: Vec<String> = error.chain().map(ToString::to_string).collect();
        self.result.error = Some(chain.join("; Caused by: "));
        self
    }

    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.details.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn build(self) -> HealthCheckResult {
        self.result
    }
}

/// A named, groupable, orderable health probe.
///
/// Implementations must capture their own failures in the returned result;
/// nothing thrown by a probe is translated by the registry. Checks are
/// invoked from whichever thread asks, so implementations that are not
/// safe to call concurrently must serialize internally.
pub trait HealthCheck: Send + Sync {
    /// Unique id of the check.
    fn id(&self) -> &str;

    /// Optional group; checks without one belong to the default group.
    fn group(&self) -> Option<&str> {
        None
    }

    /// Execution order; lower runs first. Ties keep discovery order.
    fn order(&self) -> i32 {
        i32::MAX
    }

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Whether the check participates in readiness evaluation.
    fn is_readiness(&self) -> bool {
        true
    }

    /// Whether the check participates in liveness evaluation.
    fn is_liveness(&self) -> bool {
        true
    }

    /// Runs the probe.
    fn call(&self, options: &HealthOptions) -> HealthCheckResult;
}
