//! Daily capture quota
//!
//! Caps the number of capture attempts per UTC day. The counter rolls over
//! the first time it is touched on a new UTC date, so a process that stays
//! up across midnight starts the new day with a fresh allowance.

use crate::config::ConfigHandle;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Source of wall-clock time for UTC day boundaries
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Result of a reservation; `granted` may be smaller than requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaGrant {
    pub date: NaiveDate,
    pub requested: u64,
    pub granted: u64,
}

impl QuotaGrant {
    pub fn denied(&self) -> u64 {
        self.requested - self.granted
    }

    pub fn is_partial(&self) -> bool {
        self.granted < self.requested
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub date: NaiveDate,
    pub used: u64,
    pub limit: u64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

#[derive(Debug)]
struct QuotaCounter {
    date: NaiveDate,
    used: u64,
}

pub struct DailyQuotaTracker {
    counter: Mutex<QuotaCounter>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
}

impl DailyQuotaTracker {
    pub fn new(config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        let date = clock.today();
        Self {
            counter: Mutex::new(QuotaCounter { date, used: 0 }),
            clock,
            config,
        }
    }

    /// Reserves up to `n` attempts from today's allowance.
    pub fn reserve(&self, n: u64) -> QuotaGrant {
        let limit = self.config.current().daily_limit;
        let today = self.clock.today();
        let mut counter = self.lock();

        if counter.date != today {
            info!(
                "Daily quota rolled over from {} to {} ({} attempts used)",
                counter.date, today, counter.used
            );
            counter.date = today;
            counter.used = 0;
        }

        // A lowered limit can leave `used` above it; never grant in that case
        let remaining = limit.saturating_sub(counter.used);
        let granted = n.min(remaining);
        counter.used += granted;

        if granted < n {
            warn!(
                "Daily quota exhausted: requested {}, granted {} ({}/{} used)",
                n, granted, counter.used, limit
            );
        }

        QuotaGrant {
            date: today,
            requested: n,
            granted,
        }
    }

    /// Returns unused reservations made on `date`; ignored after rollover.
    pub fn release(&self, date: NaiveDate, n: u64) {
        let mut counter = self.lock();
        if counter.date == date {
            counter.used = counter.used.saturating_sub(n);
        }
    }

    /// Today's usage. Never mutates: a stale counter is reported as zero.
    pub fn usage(&self) -> QuotaUsage {
        let limit = self.config.current().daily_limit;
        let today = self.clock.today();
        let counter = self.lock();

        let used = if counter.date == today { counter.used } else { 0 };
        QuotaUsage {
            date: today,
            used,
            limit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaCounter> {
        self.counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
