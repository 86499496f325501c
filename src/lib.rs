//! # Capture Optimizer
//!
//! A concurrency-controlled, rate-limited orchestration layer for refreshing
//! snapshots of competitor websites. One request carries a caller-sized batch
//! of targets; the optimizer captures as many as the shared limits allow and
//! reports the rest as typed, partial failures instead of aborting.
//!
//! ## Protection layers
//!
//! | Layer | Component | Default |
//! |-------|-----------|---------|
//! | Global concurrency | [`ConcurrencyLimiterPool`] | 20 in flight |
//! | Per-scope concurrency | [`ConcurrencyLimiterPool`] | 5 in flight |
//! | Domain spacing | [`DomainThrottleTracker`] | 10s between requests |
//! | Failure-rate breaker | [`CircuitBreaker`] | 50% over 5 minutes, 30s cooldown |
//! | Daily cost cap | [`DailyQuotaTracker`] | 1000 attempts per UTC day |
//! | Batch deadline | [`CaptureOrchestrator`] | 60s soft cutoff |
//!
//! Per-target timeouts come from the [`ComplexityProfile`] of each URL:
//! marketplaces get 45s, plain sites 15s.
//!
//! ## Features
//!
//! - **Partial results**: `captured + skipped + failed == total`, always
//! - **Hot reload**: every component reads the live [`CaptureConfig`] per operation
//! - **Non-blocking status**: progress events are dropped, never awaited, when the sink lags
//! - **Cancellation safety**: permits are RAII guards returned on every exit path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_optimizer::{
//!     CaptureConfig, CaptureOrchestrator, CaptureRequest, CaptureState, CaptureTarget,
//!     HttpFetcher, MemorySnapshotStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = Arc::new(CaptureState::with_config(CaptureConfig::default()));
//!     let orchestrator = CaptureOrchestrator::new(state, Arc::new(MemorySnapshotStore::new()));
//!
//!     let request = CaptureRequest::new(
//!         "project-42",
//!         vec![
//!             CaptureTarget::new("acme", "https://acme.com/pricing")?,
//!             CaptureTarget::new("globex", "https://globex.io/product")?,
//!         ],
//!     );
//!     let result = orchestrator.capture_all(request, Arc::new(HttpFetcher::new()?)).await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! capture-optimizer capture --input request.json --output snapshots/ --throttle-ms 5000
//! capture-optimizer classify --url https://www.amazon.com/dp/B000
//! capture-optimizer validate --config capture.json
//! ```

/// Capture limits, hot-reloadable config handle and request types
pub mod config;

/// Error types and per-target failure categories
pub mod error;

/// URL classification into timeout profiles
pub mod complexity;

/// Per-domain request spacing
pub mod throttle;

/// Failure-rate circuit breaker
pub mod circuit_breaker;

/// Daily attempt quota with UTC rollover
pub mod quota;

/// Global and per-scope concurrency permits
pub mod limiter;

/// Per-target and aggregate results
pub mod result;

/// Batch progress accounting
pub mod progress;

/// Best-effort progress events
pub mod status;

/// Page fetch capability and the HTTP reference fetcher
pub mod fetcher;

/// Snapshot persistence
pub mod store;

/// Batch orchestration
pub mod orchestrator;

/// Command-line interface implementation
pub mod cli;

/// Metrics recording and Prometheus export
pub mod metrics;

/// Status snapshot and health levels
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use self::metrics::{CaptureMetrics, PrometheusExporter};
pub use circuit_breaker::*;
pub use cli::*;
pub use complexity::*;
pub use config::*;
pub use error::*;
pub use fetcher::*;
pub use health::*;
pub use limiter::*;
pub use orchestrator::*;
pub use progress::*;
pub use quota::*;
pub use result::*;
pub use status::*;
pub use store::*;
pub use throttle::*;
pub use utils::*;
