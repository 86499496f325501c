use crate::config::ConfigHandle;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe: Option<u64>,
    next_probe: u64,
    times_opened: u64,
}

/// Read-only view of the breaker for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub state: CircuitState,
    pub window_samples: usize,
    pub window_failures: usize,
    pub times_opened: u64,
}

/// Admission handed out by [`CircuitBreaker::should_allow`]
///
/// Report the attempt's outcome through [`BreakerTicket::record`]. A probe
/// ticket dropped without a result, for example when the fetch panics,
/// counts as a failed probe and reopens the breaker.
pub struct BreakerTicket<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
    resolved: bool,
}

impl BreakerTicket<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn record(mut self, success: bool) {
        self.resolved = true;
        self.breaker.record(self.probe, success);
    }
}

impl Drop for BreakerTicket<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Some(probe) = self.probe {
            warn!("Circuit breaker probe abandoned without a result");
            self.breaker.record(Some(probe), false);
        }
    }
}

/// Failure-rate circuit breaker shared by every capture
///
/// Tracks outcomes in a sliding time window. Trips open once the windowed
/// error rate reaches the configured threshold with enough samples, rejects
/// attempts during the cooldown, then lets exactly one probe through. Only
/// the probe's own ticket can close or reopen a half-open breaker.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: ConfigHandle,
}

impl CircuitBreaker {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probe: None,
                next_probe: 0,
                times_opened: 0,
            }),
            config,
        }
    }

    /// Admits a new attempt, or returns `None` when it must be rejected.
    ///
    /// Moves OPEN to HALF_OPEN once the cooldown has elapsed and hands the
    /// caller the single probe ticket.
    pub fn should_allow(&self) -> Option<BreakerTicket<'_>> {
        let cooldown = self.config.current().breaker_cooldown();
        let mut inner = self.lock();

        let probe = match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                info!("Circuit breaker half-open, allowing probe");
                inner.state = CircuitState::HalfOpen;
                Some(Self::grant_probe(&mut inner))
            }
            CircuitState::HalfOpen => {
                if inner.probe.is_some() {
                    return None;
                }
                Some(Self::grant_probe(&mut inner))
            }
        };

        Some(BreakerTicket {
            breaker: self,
            probe,
            resolved: false,
        })
    }

    /// Records an outcome that carries no ticket.
    ///
    /// It lands in the window and may trip a closed breaker, but never
    /// resolves a half-open probe.
    pub fn record_outcome(&self, success: bool) {
        self.record(None, success);
    }

    fn record(&self, probe: Option<u64>, success: bool) {
        let config = self.config.current();
        let now = Instant::now();
        let mut inner = self.lock();

        inner.window.push_back((now, success));
        Self::prune(&mut inner.window, now, config.breaker_window());

        match inner.state {
            CircuitState::Closed => {
                let samples = inner.window.len();
                let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
                let error_rate = failures as f64 / samples as f64;

                if samples >= config.breaker_min_samples
                    && error_rate >= config.breaker_error_threshold
                {
                    warn!(
                        "Circuit breaker opened: {}/{} failures ({:.0}%) in window",
                        failures,
                        samples,
                        error_rate * 100.0
                    );
                    Self::trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if probe.is_some() && probe == inner.probe => {
                inner.probe = None;
                if success {
                    info!("Circuit breaker closed after successful probe");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.window.clear();
                } else {
                    warn!("Circuit breaker probe failed, reopening");
                    Self::trip(&mut inner, now);
                }
            }
            // Late results from fetches admitted before the trip
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of the breaker. Does not prune or transition.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: inner.state,
            window_samples: inner.window.len(),
            window_failures: inner.window.iter().filter(|(_, ok)| !ok).count(),
            times_opened: inner.times_opened,
        }
    }

    /// Time left before an open breaker admits a probe.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let cooldown = self.config.current().breaker_cooldown();
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => Some(cooldown.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.window.clear();
        inner.opened_at = None;
        inner.probe = None;
    }

    fn trip(inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.probe = None;
        inner.times_opened += 1;
    }

    fn grant_probe(inner: &mut BreakerInner) -> u64 {
        inner.next_probe += 1;
        inner.probe = Some(inner.next_probe);
        inner.next_probe
    }

    fn prune(window: &mut VecDeque<(Instant, bool)>, now: Instant, length: Duration) {
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > length {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
