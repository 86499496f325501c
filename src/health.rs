use crate::circuit_breaker::CircuitState;
use crate::config::CaptureConfig;
use crate::quota::QuotaUsage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Share of the daily quota at which the optimizer reports a warning
    pub quota_warning_ratio: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            quota_warning_ratio: 0.8,
        }
    }
}

/// Point-in-time view of the shared capture state
///
/// Built from read-only accessors, so two snapshots taken with no capture
/// activity in between compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub circuit_breaker_state: CircuitState,
    pub daily_count: u64,
    pub daily_limit: u64,
    pub active_throttled_domains: Vec<String>,
    pub current_config: CaptureConfig,
    pub health: HealthLevel,
}

impl CaptureStatus {
    pub fn new(
        circuit_breaker_state: CircuitState,
        usage: QuotaUsage,
        active_throttled_domains: Vec<String>,
        current_config: CaptureConfig,
        thresholds: &HealthThresholds,
    ) -> Self {
        let health = determine_overall_health(&[
            breaker_health(circuit_breaker_state),
            quota_health(&usage, thresholds),
        ]);

        Self {
            circuit_breaker_state,
            daily_count: usage.used,
            daily_limit: usage.limit,
            active_throttled_domains,
            current_config,
            health,
        }
    }
}

fn breaker_health(state: CircuitState) -> HealthLevel {
    match state {
        CircuitState::Closed => HealthLevel::Healthy,
        CircuitState::HalfOpen => HealthLevel::Warning,
        CircuitState::Open => HealthLevel::Critical,
    }
}

fn quota_health(usage: &QuotaUsage, thresholds: &HealthThresholds) -> HealthLevel {
    if usage.remaining() == 0 {
        return HealthLevel::Critical;
    }

    let ratio = usage.used as f64 / usage.limit as f64;
    if ratio >= thresholds.quota_warning_ratio {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

pub fn determine_overall_health(healths: &[HealthLevel]) -> HealthLevel {
    if healths.contains(&HealthLevel::Critical) {
        HealthLevel::Critical
    } else if healths.contains(&HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}
