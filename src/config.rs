//! Configuration management with serde serialization/deserialization
//!
//! This module provides the capture limits and thresholds, the hot-reloadable
//! config handle shared by every component, and the request types a caller
//! submits to the orchestrator.

use crate::error::CaptureError;
use crate::utils::{normalize_host, validate_url};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Limits and thresholds for snapshot capture
///
/// Every component reads the current snapshot of this struct on each
/// operation, so a hot reload takes effect without restarting anything.
///
/// # Examples
///
/// ```rust
/// use capture_optimizer::CaptureConfig;
///
/// let config = CaptureConfig {
///     global_concurrency: 10,
///     throttle_ms: 5_000,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum captures in flight across all scopes (default: 20)
    pub global_concurrency: usize,

    /// Maximum captures in flight for a single scope (default: 5)
    pub scope_concurrency: usize,

    /// Minimum spacing between two requests to the same domain (default: 10s)
    pub throttle_ms: u64,

    /// Soft deadline after which a batch stops starting new fetches (default: 60s)
    pub batch_deadline_ms: u64,

    /// Capture attempts allowed per UTC day (default: 1000)
    pub daily_limit: u64,

    /// Windowed error rate that trips the circuit breaker (default: 0.5)
    pub breaker_error_threshold: f64,

    /// Length of the circuit breaker's sliding outcome window (default: 5 minutes)
    pub breaker_window_ms: u64,

    /// Outcomes required in the window before the breaker may trip (default: 5)
    pub breaker_min_samples: usize,

    /// Time the breaker stays open before allowing a probe (default: 30s)
    pub breaker_cooldown_ms: u64,

    /// Throttle entries idle for longer than this are evicted (default: 10 minutes)
    pub throttle_idle_eviction_ms: u64,

    /// Minimum interval between two eviction sweeps (default: 60s)
    pub throttle_sweep_interval_ms: u64,

    /// Capacity of the outbound progress event channel (default: 256)
    pub status_channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 20,
            scope_concurrency: 5,
            throttle_ms: 10_000,
            batch_deadline_ms: 60_000,
            daily_limit: 1000,
            breaker_error_threshold: 0.5,
            breaker_window_ms: 5 * 60 * 1000,
            breaker_min_samples: 5,
            breaker_cooldown_ms: 30_000,
            throttle_idle_eviction_ms: 10 * 60 * 1000,
            throttle_sweep_interval_ms: 60_000,
            status_channel_capacity: 256,
        }
    }
}

impl CaptureConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_millis(self.breaker_window_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn throttle_idle_eviction(&self) -> Duration {
        Duration::from_millis(self.throttle_idle_eviction_ms)
    }

    pub fn throttle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.global_concurrency == 0 {
            return Err(CaptureError::Configuration(
                "global concurrency must be greater than 0".into(),
            ));
        }

        if self.scope_concurrency == 0 {
            return Err(CaptureError::Configuration(
                "scope concurrency must be greater than 0".into(),
            ));
        }

        if self.batch_deadline_ms == 0 {
            return Err(CaptureError::Configuration(
                "batch deadline must be greater than 0".into(),
            ));
        }

        if !(self.breaker_error_threshold > 0.0 && self.breaker_error_threshold <= 1.0) {
            return Err(CaptureError::Configuration(format!(
                "breaker error threshold must be in (0, 1], got {}",
                self.breaker_error_threshold
            )));
        }

        if self.breaker_min_samples == 0 {
            return Err(CaptureError::Configuration(
                "breaker minimum sample size must be greater than 0".into(),
            ));
        }

        if self.breaker_window_ms == 0 {
            return Err(CaptureError::Configuration(
                "breaker window must be greater than 0".into(),
            ));
        }

        if self.status_channel_capacity == 0 {
            return Err(CaptureError::Configuration(
                "status channel capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Returns a copy with every field present in `partial` replaced.
    pub fn merged(&self, partial: &PartialConfig) -> CaptureConfig {
        let mut next = self.clone();

        if let Some(v) = partial.global_concurrency {
            next.global_concurrency = v;
        }
        if let Some(v) = partial.scope_concurrency {
            next.scope_concurrency = v;
        }
        if let Some(v) = partial.throttle_ms {
            next.throttle_ms = v;
        }
        if let Some(v) = partial.batch_deadline_ms {
            next.batch_deadline_ms = v;
        }
        if let Some(v) = partial.daily_limit {
            next.daily_limit = v;
        }
        if let Some(v) = partial.breaker_error_threshold {
            next.breaker_error_threshold = v;
        }
        if let Some(v) = partial.breaker_window_ms {
            next.breaker_window_ms = v;
        }
        if let Some(v) = partial.breaker_min_samples {
            next.breaker_min_samples = v;
        }
        if let Some(v) = partial.breaker_cooldown_ms {
            next.breaker_cooldown_ms = v;
        }
        if let Some(v) = partial.throttle_idle_eviction_ms {
            next.throttle_idle_eviction_ms = v;
        }
        if let Some(v) = partial.throttle_sweep_interval_ms {
            next.throttle_sweep_interval_ms = v;
        }
        if let Some(v) = partial.status_channel_capacity {
            next.status_channel_capacity = v;
        }

        next
    }
}

/// Sparse config update used for hot reloads
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PartialConfig {
    pub global_concurrency: Option<usize>,
    pub scope_concurrency: Option<usize>,
    pub throttle_ms: Option<u64>,
    pub batch_deadline_ms: Option<u64>,
    pub daily_limit: Option<u64>,
    pub breaker_error_threshold: Option<f64>,
    pub breaker_window_ms: Option<u64>,
    pub breaker_min_samples: Option<usize>,
    pub breaker_cooldown_ms: Option<u64>,
    pub throttle_idle_eviction_ms: Option<u64>,
    pub throttle_sweep_interval_ms: Option<u64>,
    pub status_channel_capacity: Option<usize>,
}

/// Source of the live [`CaptureConfig`].
pub trait QuotaConfigProvider: Send + Sync {
    /// The config snapshot currently in force.
    fn current(&self) -> Arc<CaptureConfig>;

    /// Validates and installs `partial` on top of the current snapshot.
    fn update(&self, partial: &PartialConfig) -> Result<Arc<CaptureConfig>, CaptureError>;
}

pub type ConfigHandle = Arc<dyn QuotaConfigProvider>;

/// In-process config provider backed by an atomically swapped snapshot
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<CaptureConfig>>>,
}

impl SharedConfig {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn handle(config: CaptureConfig) -> ConfigHandle {
        Arc::new(Self::new(config))
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(CaptureConfig::default())
    }
}

impl QuotaConfigProvider for SharedConfig {
    fn current(&self) -> Arc<CaptureConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update(&self, partial: &PartialConfig) -> Result<Arc<CaptureConfig>, CaptureError> {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let next = slot.merged(partial);
        next.validate()?;

        let next = Arc::new(next);
        *slot = next.clone();
        Ok(next)
    }
}

/// Priority hint attached to a capture request
///
/// The hint is carried into logs and progress events so downstream consumers
/// can order their own work; it does not bypass any limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for Priority {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(CaptureError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// One competitor URL to capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TargetSpec")]
pub struct CaptureTarget {
    pub id: String,
    pub url: String,
    pub domain: String,
}

#[derive(Debug, Deserialize)]
struct TargetSpec {
    id: String,
    url: String,
}

impl TryFrom<TargetSpec> for CaptureTarget {
    type Error = CaptureError;

    fn try_from(spec: TargetSpec) -> Result<Self, Self::Error> {
        CaptureTarget::new(spec.id, spec.url)
    }
}

impl CaptureTarget {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Result<Self, CaptureError> {
        let id = id.into();
        let url = url.into();

        let parsed = validate_url(&url)?;
        let domain = parsed
            .host_str()
            .map(normalize_host)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CaptureError::Validation(format!("target '{id}' URL has no host")))?;

        Ok(Self { id, url, domain })
    }
}

/// A batch of targets captured under one scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub scope_id: String,
    pub targets: Vec<CaptureTarget>,
    #[serde(default)]
    pub priority: Priority,
}

impl CaptureRequest {
    pub fn new(scope_id: impl Into<String>, targets: Vec<CaptureTarget>) -> Self {
        Self {
            scope_id: scope_id.into(),
            targets,
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Structural checks that must pass before any work is scheduled.
    pub fn validate(&self) -> Result<(), CaptureError> {
        let mut seen = std::collections::HashSet::with_capacity(self.targets.len());

        for target in &self.targets {
            if target.id.trim().is_empty() {
                return Err(CaptureError::Validation(format!(
                    "target for '{}' has an empty id",
                    target.url
                )));
            }
            if target.domain.is_empty() {
                return Err(CaptureError::Validation(format!(
                    "target '{}' has no domain",
                    target.id
                )));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(CaptureError::Validation(format!(
                    "duplicate target id '{}'",
                    target.id
                )));
            }
        }

        Ok(())
    }
}
