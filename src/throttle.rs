//! Per-domain request spacing
//!
//! Every capture waits here until the configured spacing has elapsed since
//! the previous request to the same domain. Callers for one domain queue on
//! that domain's async mutex, which is held across the wait, so two requests
//! can never start closer together than the spacing.

use crate::config::ConfigHandle;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct DomainSlot {
    /// Start time of the most recent request; the lock doubles as the per-domain queue.
    last_request: Mutex<Option<Instant>>,
    requests: AtomicU64,
    failures: AtomicU64,
}

/// Returned by [`DomainThrottleTracker::acquire`] once the caller may proceed
#[derive(Debug, Clone)]
pub struct ThrottlePass {
    pub domain: String,
    pub waited: Duration,
    pub throttled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStats {
    pub domain: String,
    pub requests: u64,
    pub failures: u64,
}

pub struct DomainThrottleTracker {
    config: ConfigHandle,
    domains: DashMap<String, Arc<DomainSlot>>,
    last_sweep: std::sync::Mutex<Instant>,
}

impl DomainThrottleTracker {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            domains: DashMap::new(),
            last_sweep: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Waits until `domain` may be requested again and records the new request.
    ///
    /// Cancel safe: if the returned future is dropped before completion no
    /// timestamp is recorded.
    pub async fn acquire(&self, domain: &str) -> ThrottlePass {
        self.maybe_sweep();

        let spacing = self.config.current().throttle();
        let slot = self.slot(domain);
        let started = Instant::now();

        let mut last_request = slot.last_request.lock().await;
        let mut throttled = false;

        if let Some(last) = *last_request {
            let ready_at = last + spacing;
            if ready_at > Instant::now() {
                debug!(
                    "Throttling {} for {:?}",
                    domain,
                    ready_at.saturating_duration_since(Instant::now())
                );
                throttled = true;
                sleep_until(ready_at).await;
            }
        }

        *last_request = Some(Instant::now());
        slot.requests.fetch_add(1, Ordering::Relaxed);

        ThrottlePass {
            domain: domain.to_string(),
            waited: started.elapsed(),
            throttled,
        }
    }

    pub fn record_outcome(&self, domain: &str, success: bool) {
        if success {
            return;
        }

        if let Some(slot) = self.domains.get(domain) {
            slot.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Domains currently tracked, sorted. Has no side effects.
    pub fn active_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    pub fn domain_stats(&self, domain: &str) -> Option<DomainStats> {
        self.domains.get(domain).map(|slot| DomainStats {
            domain: domain.to_string(),
            requests: slot.requests.load(Ordering::Relaxed),
            failures: slot.failures.load(Ordering::Relaxed),
        })
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Evicts domains idle for longer than the configured eviction age.
    ///
    /// An entry is only removed when no caller holds or waits on it, and never
    /// before the throttle spacing itself has elapsed. Returns the number of
    /// evicted domains.
    pub fn sweep(&self) -> usize {
        let config = self.config.current();
        let max_idle = config.throttle_idle_eviction().max(config.throttle());
        let now = Instant::now();
        let before = self.domains.len();

        // `retain` holds each shard's write lock, so no caller can clone a slot mid-check
        self.domains.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.last_request.try_lock() {
                Ok(last) => match *last {
                    Some(at) => now.saturating_duration_since(at) <= max_idle,
                    None => false,
                },
                Err(_) => true,
            }
        });

        let evicted = before.saturating_sub(self.domains.len());
        if evicted > 0 {
            debug!("Evicted {} idle throttle entries", evicted);
        }
        evicted
    }

    fn maybe_sweep(&self) {
        let interval = self.config.current().throttle_sweep_interval();

        let due = match self.last_sweep.try_lock() {
            Ok(mut last) if last.elapsed() >= interval => {
                *last = Instant::now();
                true
            }
            _ => false,
        };

        if due {
            self.sweep();
        }
    }

    fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        if let Some(slot) = self.domains.get(domain) {
            return slot.clone();
        }
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainSlot::default()))
            .clone()
    }
}
