use crate::error::{CaptureError, FailureCategory};
use metrics::{counter, gauge, histogram};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

/// Recording helpers for the capture pipeline
///
/// Without an installed recorder every call is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureMetrics;

impl CaptureMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_attempt(&self) {
        counter!("capture_attempts_total", 1);
    }

    pub fn record_capture(&self, duration: Duration, category: Option<FailureCategory>) {
        histogram!("capture_duration_seconds", duration.as_secs_f64());
        if let Some(category) = category {
            self.record_failure(category);
        }
    }

    /// Failures that never reached the fetcher have no duration.
    pub fn record_failure(&self, category: FailureCategory) {
        counter!("capture_failures_total", 1, "category" => category.as_str());
    }

    pub fn set_quota_used(&self, used: u64) {
        gauge!("capture_quota_used", used as f64);
    }
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Installs the global recorder and serves `/metrics` on the port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), CaptureError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| CaptureError::Configuration(format!("metrics exporter: {e}")))?;

        info!("Serving Prometheus metrics on {}", addr);
        Ok(())
    }
}
