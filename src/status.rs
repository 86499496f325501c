//! Best-effort progress events
//!
//! Capture tasks hand events to a bounded channel with `try_send` and move
//! on. A background task drains the channel into the configured sink. When
//! the channel is full the event is dropped and counted.

use crate::config::Priority;
use crate::error::FailureCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Progress notification for one finished target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub batch_id: String,
    pub scope_id: String,
    pub target_id: String,
    pub priority: Priority,
    pub success: bool,
    pub category: Option<FailureCategory>,
    pub duration_ms: u64,
    pub completed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, event: ProgressEvent);
}

/// Sink that writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusSink;

#[async_trait]
impl StatusSink for TracingStatusSink {
    async fn publish(&self, event: ProgressEvent) {
        match event.category {
            None => info!(
                "[{}/{}] {} captured in {}ms",
                event.completed, event.total, event.target_id, event.duration_ms
            ),
            Some(category) => info!(
                "[{}/{}] {} failed ({})",
                event.completed, event.total, event.target_id, category
            ),
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusSink;

#[async_trait]
impl StatusSink for NullStatusSink {
    async fn publish(&self, _event: ProgressEvent) {}
}

/// Non-blocking front of the status channel
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl StatusPublisher {
    /// Starts the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn StatusSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.publish(event).await;
            }
            debug!("Status channel closed");
        });

        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Queues an event without waiting. Returns false if it was dropped.
    pub fn publish(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_status_events_dropped_total", 1);
                warn!("Status channel full, dropped event for {}", event.target_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
