use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Errors surfaced to callers of the capture optimizer.
///
/// Per-target problems are never reported through this type; they end up as
/// [`FailureCategory`] entries inside the aggregate result.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid capture request: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Snapshot storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl CaptureError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::Validation(_) => ErrorSeverity::Low,
            CaptureError::Configuration(_) => ErrorSeverity::Medium,
            CaptureError::Io(_) | CaptureError::Serialization(_) => ErrorSeverity::Medium,
            CaptureError::Storage(_) => ErrorSeverity::High,
            CaptureError::Invariant(_) => ErrorSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Typed error returned by a [`crate::PageFetcher`].
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by target: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Access denied: {0}")]
    Permission(String),

    #[error("Fetch failed: {0}")]
    Other(String),
}

impl FetchError {
    /// Maps the fetch error onto the per-target failure taxonomy.
    ///
    /// `Other` errors carry free-form text from the fetch engine, so they are
    /// classified by message.
    pub fn category(&self) -> FailureCategory {
        match self {
            FetchError::Timeout(_) => FailureCategory::Timeout,
            FetchError::RateLimited(_) => FailureCategory::RateLimited,
            FetchError::Network(_) => FailureCategory::Network,
            FetchError::Permission(_) => FailureCategory::Permission,
            FetchError::Other(message) => FailureCategory::classify_message(message),
        }
    }
}

/// Why a single target could not be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureCategory {
    Timeout,
    RateLimited,
    Network,
    Permission,
    Unknown,
    QuotaExceeded,
    CircuitOpen,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::RateLimited => "rateLimited",
            FailureCategory::Network => "network",
            FailureCategory::Permission => "permission",
            FailureCategory::Unknown => "unknown",
            FailureCategory::QuotaExceeded => "quotaExceeded",
            FailureCategory::CircuitOpen => "circuitOpen",
        }
    }

    /// Skipped targets were never attempted and count separately from failures.
    pub fn is_skip(&self) -> bool {
        matches!(self, FailureCategory::QuotaExceeded)
    }

    pub fn classify_message(message: &str) -> FailureCategory {
        let lower = message.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") {
            FailureCategory::Timeout
        } else if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
            FailureCategory::RateLimited
        } else if lower.contains("403")
            || lower.contains("401")
            || lower.contains("forbidden")
            || lower.contains("unauthorized")
            || lower.contains("permission")
        {
            FailureCategory::Permission
        } else if lower.contains("dns")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("econnreset")
            || lower.contains("econnrefused")
            || lower.contains("enotfound")
        {
            FailureCategory::Network
        } else {
            FailureCategory::Unknown
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AcquireError> for CaptureError {
    fn from(err: AcquireError) -> Self {
        CaptureError::Invariant(format!("permit pool closed: {err}"))
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}
