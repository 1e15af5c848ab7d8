//! Serializable health summary.

use std::collections::BTreeMap;

use camber_core::{HealthCheckResult, HealthState};
use serde::{Deserialize, Serialize};

use super::helper::is_results_up;
use super::registry::ExposureLevel;

/// Overall status plus per-check entries, shaped by an [`ExposureLevel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub status: HealthState,
    #[serde(
        rename = "error-message",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, serde_json::Value>>,
}

impl HealthReport {
    /// Builds a report from `results`.
    ///
    /// `Oneline` carries only the status, `Default` lists the checks that
    /// are down, `Full` lists every check with its error text. Details are
    /// included only when `include_data` is set.
    #[must_use]
    pub fn render(
        results: &[HealthCheckResult],
        readiness: bool,
        level: ExposureLevel,
        include_data: bool,
    ) -> Self {
        let status = if is_results_up(results, readiness) {
            HealthState::Up
        } else {
            HealthState::Down
        };

        let checks = match level {
            ExposureLevel::Oneline => Vec::new(),
            ExposureLevel::Default => results
                .iter()
                .filter(|r| r.is_down())
                .map(|r| CheckReport::from_result(r, false, include_data))
                .collect(),
            ExposureLevel::Full => results
                .iter()
                .map(|r| CheckReport::from_result(r, true, include_data))
                .collect(),
        };

        Self { status, checks }
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.status == HealthState::Up
    }
}

impl CheckReport {
    fn from_result(result: &HealthCheckResult, include_error: bool, include_data: bool) -> Self {
        let data = (include_data && !result.details.is_empty()).then(|| {
            result
                .details
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect()
        });
        Self {
            name: result.check_id.clone(),
            status: result.state,
            error: if include_error {
                result.error.clone()
            } else {
                None
            },
            message: result.message.clone(),
            data,
        }
    }
}
