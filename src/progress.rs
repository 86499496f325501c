use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-batch completion and concurrency accounting
///
/// Cloned into every target task; all clones share the same counters.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    completed: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    start_time: Instant,
}

/// Marks one fetch as in flight until dropped
#[derive(Debug)]
pub struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        metrics::decrement_gauge!("capture_in_flight", 1.0);
    }
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: Arc::new(AtomicUsize::new(0)),
            errors: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn start_active(&self) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        metrics::increment_gauge!("capture_in_flight", 1.0);

        ActiveGuard {
            active: self.active.clone(),
        }
    }

    /// Records one finished target and returns the completed count.
    pub fn record_completion(&self, success: bool) -> usize {
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            success: completed.saturating_sub(errors),
            active: self.active.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub active: usize,
    pub elapsed: Duration,
}
