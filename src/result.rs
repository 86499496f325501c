use crate::error::FailureCategory;
use crate::store::SnapshotRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFailure {
    pub target_id: String,
    pub url: String,
    pub category: FailureCategory,
    pub message: String,
}

/// Outcome of one target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub target_id: String,
    pub url: String,
    pub success: bool,
    pub snapshot: Option<SnapshotRef>,
    pub failure: Option<CaptureFailure>,
    pub duration_ms: u64,
    /// False when the target never reached the fetcher.
    pub attempted: bool,
}

impl CaptureResult {
    pub fn captured(target_id: &str, url: &str, snapshot: SnapshotRef, duration: Duration) -> Self {
        Self {
            target_id: target_id.to_string(),
            url: url.to_string(),
            success: true,
            snapshot: Some(snapshot),
            failure: None,
            duration_ms: crate::utils::duration_to_millis(duration),
            attempted: true,
        }
    }

    pub fn failed(
        target_id: &str,
        url: &str,
        category: FailureCategory,
        message: impl Into<String>,
        duration: Duration,
        attempted: bool,
    ) -> Self {
        Self {
            target_id: target_id.to_string(),
            url: url.to_string(),
            success: false,
            snapshot: None,
            failure: Some(CaptureFailure {
                target_id: target_id.to_string(),
                url: url.to_string(),
                category,
                message: message.into(),
            }),
            duration_ms: crate::utils::duration_to_millis(duration),
            attempted,
        }
    }

    pub fn category(&self) -> Option<FailureCategory> {
        self.failure.as_ref().map(|f| f.category)
    }

    pub fn is_skipped(&self) -> bool {
        self.category().map(|c| c.is_skip()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub average_capture_ms: f64,
    pub peak_concurrency: usize,
    pub throttled_domains: BTreeSet<String>,
}

/// Batch-level summary returned by `capture_all`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub batch_id: String,
    pub captured_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub total_targets: usize,
    pub failures: Vec<CaptureFailure>,
    pub results: Vec<CaptureResult>,
    pub rate_limiting_triggered: bool,
    pub circuit_breaker_activated: bool,
    pub resource_usage: ResourceUsage,
    pub elapsed_ms: u64,
}

impl AggregateResult {
    pub fn empty(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            ..Default::default()
        }
    }

    /// Builds the summary; counts are derived from `results` so they always
    /// add up to the number of targets.
    pub fn from_results(
        batch_id: impl Into<String>,
        results: Vec<CaptureResult>,
        peak_concurrency: usize,
        throttled_domains: BTreeSet<String>,
        elapsed: Duration,
    ) -> Self {
        let total_targets = results.len();
        let captured_count = results.iter().filter(|r| r.success).count();
        let skipped_count = results.iter().filter(|r| r.is_skipped()).count();
        let failed_count = total_targets - captured_count - skipped_count;

        let failures: Vec<CaptureFailure> = results.iter().filter_map(|r| r.failure.clone()).collect();

        let attempted: Vec<u64> = results
            .iter()
            .filter(|r| r.attempted)
            .map(|r| r.duration_ms)
            .collect();
        let average_capture_ms = if attempted.is_empty() {
            0.0
        } else {
            attempted.iter().sum::<u64>() as f64 / attempted.len() as f64
        };

        let rate_limiting_triggered = failures.iter().any(|f| {
            matches!(
                f.category,
                FailureCategory::QuotaExceeded | FailureCategory::RateLimited
            )
        });
        let circuit_breaker_activated = failures
            .iter()
            .any(|f| f.category == FailureCategory::CircuitOpen);

        Self {
            batch_id: batch_id.into(),
            captured_count,
            skipped_count,
            failed_count,
            total_targets,
            failures,
            results,
            rate_limiting_triggered,
            circuit_breaker_activated,
            resource_usage: ResourceUsage {
                average_capture_ms,
                peak_concurrency,
                throttled_domains,
            },
            elapsed_ms: crate::utils::duration_to_millis(elapsed),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.captured_count == self.total_targets
    }

    /// Human-readable line for downstream reports.
    pub fn summary(&self) -> String {
        let missing = self.total_targets - self.captured_count;
        if missing == 0 {
            format!("All {} targets refreshed", self.total_targets)
        } else {
            format!(
                "{} of {} could not be refreshed",
                missing, self.total_targets
            )
        }
    }
}
