//! Global and per-scope concurrency permits
//!
//! Permits are owned semaphore permits wrapped in guards, so they are
//! returned on every exit path including cancellation and panics. Scope
//! limiters live in a registry keyed by scope id and are removed as soon as
//! the last lease on the scope is dropped.

use crate::config::ConfigHandle;
use crate::error::CaptureError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug)]
struct ScopeLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    leases: usize,
}

type ScopeRegistry = DashMap<String, ScopeLimiter>;

/// Keeps a scope limiter alive while work for the scope is pending
#[derive(Debug)]
pub struct ScopeLease {
    scope_id: String,
    semaphore: Arc<Semaphore>,
    registry: Arc<ScopeRegistry>,
}

impl ScopeLease {
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        let mut last = false;
        if let Some(mut limiter) = self.registry.get_mut(&self.scope_id) {
            limiter.leases = limiter.leases.saturating_sub(1);
            last = limiter.leases == 0;
        }

        // Re-checked under the shard lock in case a new lease raced in
        if last
            && self
                .registry
                .remove_if(&self.scope_id, |_, limiter| limiter.leases == 0)
                .is_some()
        {
            debug!("Evicted idle scope limiter {}", self.scope_id);
        }
    }
}

#[derive(Debug)]
pub struct GlobalPermit {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ScopePermit {
    _permit: OwnedSemaphorePermit,
    _lease: ScopeLease,
}

/// Scope and global permit held for the duration of one capture
#[derive(Debug)]
pub struct CapturePermit {
    // Field order is drop order: global first, then scope
    _global: GlobalPermit,
    _scope: ScopePermit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub global_limit: usize,
    pub global_in_use: usize,
    pub tracked_scopes: usize,
}

/// Issues bounded global and per-scope execution permits
pub struct ConcurrencyLimiterPool {
    config: ConfigHandle,
    global: Arc<Semaphore>,
    global_limit: Mutex<usize>,
    global_in_use: Arc<AtomicUsize>,
    scopes: Arc<ScopeRegistry>,
}

impl ConcurrencyLimiterPool {
    pub fn new(config: ConfigHandle) -> Self {
        let limit = config.current().global_concurrency;
        Self {
            config,
            global: Arc::new(Semaphore::new(limit)),
            global_limit: Mutex::new(limit),
            global_in_use: Arc::new(AtomicUsize::new(0)),
            scopes: Arc::new(DashMap::new()),
        }
    }

    pub async fn acquire_global(&self) -> Result<GlobalPermit, CaptureError> {
        self.sync_global_limit();

        let permit = self.global.clone().acquire_owned().await?;
        self.global_in_use.fetch_add(1, Ordering::Relaxed);

        Ok(GlobalPermit {
            _permit: permit,
            in_use: self.global_in_use.clone(),
        })
    }

    /// Registers pending work on a scope, creating its limiter if needed.
    pub fn lease_scope(&self, scope_id: &str) -> ScopeLease {
        let limit = self.config.current().scope_concurrency;

        let mut limiter = self
            .scopes
            .entry(scope_id.to_string())
            .or_insert_with(|| {
                debug!("Creating scope limiter {} with limit {}", scope_id, limit);
                ScopeLimiter {
                    semaphore: Arc::new(Semaphore::new(limit)),
                    limit,
                    leases: 0,
                }
            });
        limiter.leases += 1;

        ScopeLease {
            scope_id: scope_id.to_string(),
            semaphore: limiter.semaphore.clone(),
            registry: self.scopes.clone(),
        }
    }

    pub async fn acquire_scope(&self, scope_id: &str) -> Result<ScopePermit, CaptureError> {
        let lease = self.lease_scope(scope_id);
        let permit = lease.semaphore.clone().acquire_owned().await?;

        Ok(ScopePermit {
            _permit: permit,
            _lease: lease,
        })
    }

    /// Takes the scope permit, then the global one, so a queued scope never
    /// sits on global capacity.
    pub async fn acquire(&self, scope_id: &str) -> Result<CapturePermit, CaptureError> {
        let scope = self.acquire_scope(scope_id).await?;
        let global = self.acquire_global().await?;

        Ok(CapturePermit {
            _global: global,
            _scope: scope,
        })
    }

    pub fn global_in_use(&self) -> usize {
        self.global_in_use.load(Ordering::Relaxed)
    }

    pub fn scope_limit(&self, scope_id: &str) -> Option<usize> {
        self.scopes.get(scope_id).map(|l| l.limit)
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            global_limit: *self.global_limit.lock().unwrap_or_else(|p| p.into_inner()),
            global_in_use: self.global_in_use(),
            tracked_scopes: self.scopes.len(),
        }
    }

    /// Brings the global semaphore in line with the live config.
    ///
    /// Growth is immediate. Shrinking retires permits as holders release
    /// them, so in-flight work is never interrupted.
    fn sync_global_limit(&self) {
        let target = self.config.current().global_concurrency;
        let mut current = self.global_limit.lock().unwrap_or_else(|p| p.into_inner());

        if target == *current {
            return;
        }

        debug!("Resizing global concurrency limit {} -> {}", *current, target);
        if target > *current {
            self.global.add_permits(target - *current);
        } else {
            let excess = (*current - target) as u32;
            let semaphore = self.global.clone();
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }
        *current = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, PartialConfig, QuotaConfigProvider, SharedConfig};
    use std::time::Duration;

    fn pool(global: usize, scope: usize) -> (ConcurrencyLimiterPool, SharedConfig) {
        let config = SharedConfig::new(CaptureConfig {
            global_concurrency: global,
            scope_concurrency: scope,
            ..Default::default()
        });
        (ConcurrencyLimiterPool::new(Arc::new(config.clone())), config)
    }

    #[tokio::test]
    async fn test_global_limit_enforced() {
        let (pool, _) = pool(2, 5);

        let a = pool.acquire_global().await.unwrap();
        let _b = pool.acquire_global().await.unwrap();
        assert_eq!(pool.global_in_use(), 2);

        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire_global()).await;
        assert!(third.is_err());

        drop(a);
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire_global()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_scope_limit_enforced() {
        let (pool, _) = pool(10, 1);

        let _first = pool.acquire("project-a").await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire("project-a")).await;
        assert!(blocked.is_err());

        // Other scopes are unaffected
        let other = tokio::time::timeout(Duration::from_millis(50), pool.acquire("project-b")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_scope_evicted_after_last_lease() {
        let (pool, _) = pool(10, 2);

        let permit = pool.acquire("project-a").await.unwrap();
        let lease = pool.lease_scope("project-a");
        assert_eq!(pool.stats().tracked_scopes, 1);

        drop(permit);
        assert_eq!(pool.stats().tracked_scopes, 1);

        drop(lease);
        assert_eq!(pool.stats().tracked_scopes, 0);
        assert_eq!(pool.global_in_use(), 0);
    }

    #[tokio::test]
    async fn test_permits_released_on_cancellation() {
        let (pool, _) = pool(1, 1);
        let pool = Arc::new(pool);

        let held = pool.acquire("s").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("s").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert_eq!(pool.global_in_use(), 0);
        assert_eq!(pool.stats().tracked_scopes, 0);
        assert!(tokio::time::timeout(Duration::from_millis(50), pool.acquire("s")).await.is_ok());
    }

    #[tokio::test]
    async fn test_global_limit_follows_config() {
        let (pool, config) = pool(1, 5);
        let _held = pool.acquire_global().await.unwrap();

        config
            .update(&PartialConfig {
                global_concurrency: Some(2),
                ..Default::default()
            })
            .unwrap();

        let second = tokio::time::timeout(Duration::from_millis(50), pool.acquire_global()).await;
        assert!(second.is_ok());
        assert_eq!(pool.stats().global_limit, 2);
    }

    #[tokio::test]
    async fn test_new_scopes_use_current_limit() {
        let (pool, config) = pool(10, 1);
        config
            .update(&PartialConfig {
                scope_concurrency: Some(3),
                ..Default::default()
            })
            .unwrap();

        let _lease = pool.lease_scope("fresh");
        assert_eq!(pool.scope_limit("fresh"), Some(3));
    }
}
