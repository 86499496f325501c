//! Batch capture orchestration
//!
//! This module provides the `CaptureOrchestrator`, which runs one capture
//! request end to end: it reserves daily quota, fans the targets out as
//! tasks, drives each through the concurrency limiter, the domain throttle
//! and the circuit breaker, and folds every outcome into an
//! [`AggregateResult`].

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::complexity;
use crate::config::{
    CaptureConfig, CaptureRequest, CaptureTarget, ConfigHandle, PartialConfig, Priority,
    SharedConfig,
};
use crate::error::{CaptureError, ErrorSeverity, FailureCategory};
use crate::fetcher::PageFetcher;
use crate::health::{CaptureStatus, HealthThresholds};
use crate::limiter::ConcurrencyLimiterPool;
use crate::metrics::CaptureMetrics;
use crate::progress::ProgressTracker;
use crate::quota::{Clock, DailyQuotaTracker, SystemClock};
use crate::result::{AggregateResult, CaptureResult};
use crate::status::{ProgressEvent, StatusPublisher};
use crate::store::SnapshotStore;
use crate::throttle::DomainThrottleTracker;
use crate::utils::format_duration;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{timeout, timeout_at};
use tracing::{debug, error, info, warn};

/// Process-wide capture state shared by every batch
///
/// Owns the throttle map, the circuit breaker, the daily quota and the
/// permit pools. Build one per process and hand it to each orchestrator;
/// tests build a fresh one per case.
pub struct CaptureState {
    pub config: ConfigHandle,
    pub throttle: DomainThrottleTracker,
    pub breaker: CircuitBreaker,
    pub quota: DailyQuotaTracker,
    pub limiter: ConcurrencyLimiterPool,
}

impl CaptureState {
    pub fn new(config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            throttle: DomainThrottleTracker::new(config.clone()),
            breaker: CircuitBreaker::new(config.clone()),
            quota: DailyQuotaTracker::new(config.clone(), clock),
            limiter: ConcurrencyLimiterPool::new(config.clone()),
            config,
        }
    }

    pub fn with_config(config: CaptureConfig) -> Self {
        Self::new(SharedConfig::handle(config), Arc::new(SystemClock))
    }
}

/// Lookup of scopes the optimizer may capture for
#[async_trait]
pub trait ScopeDirectory: Send + Sync {
    async fn contains(&self, scope_id: &str) -> bool;
}

/// Accepts every non-blank scope id
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyScope;

#[async_trait]
impl ScopeDirectory for AnyScope {
    async fn contains(&self, scope_id: &str) -> bool {
        !scope_id.trim().is_empty()
    }
}

/// Fixed set of known scopes
#[derive(Debug, Clone, Default)]
pub struct StaticScopes {
    scopes: HashSet<String>,
}

impl StaticScopes {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ScopeDirectory for StaticScopes {
    async fn contains(&self, scope_id: &str) -> bool {
        self.scopes.contains(scope_id)
    }
}

/// Per-batch values every target task needs
#[derive(Clone)]
struct BatchContext {
    batch_id: String,
    scope_id: String,
    priority: Priority,
    deadline: tokio::time::Instant,
    fetcher: Arc<dyn PageFetcher>,
    progress: ProgressTracker,
}

struct TargetOutcome {
    result: CaptureResult,
    /// Set when the target had to wait out the domain throttle
    throttled_domain: Option<String>,
}

/// Coordinates concurrent snapshot captures for one request at a time
///
/// # Examples
///
/// ```rust,no_run
/// use capture_optimizer::{
///     CaptureConfig, CaptureOrchestrator, CaptureRequest, CaptureState, CaptureTarget,
///     HttpFetcher, MemorySnapshotStore,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let state = Arc::new(CaptureState::with_config(CaptureConfig::default()));
///     let orchestrator = CaptureOrchestrator::new(state, Arc::new(MemorySnapshotStore::new()));
///
///     let request = CaptureRequest::new(
///         "project-42",
///         vec![CaptureTarget::new("acme", "https://acme.com/pricing")?],
///     );
///     let result = orchestrator.capture_all(request, Arc::new(HttpFetcher::new()?)).await?;
///     println!("{}", result.summary());
///     Ok(())
/// }
/// ```
pub struct CaptureOrchestrator {
    state: Arc<CaptureState>,
    store: Arc<dyn SnapshotStore>,
    scopes: Arc<dyn ScopeDirectory>,
    status: Option<StatusPublisher>,
    metrics: CaptureMetrics,
    thresholds: HealthThresholds,
}

impl Clone for CaptureOrchestrator {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            store: self.store.clone(),
            scopes: self.scopes.clone(),
            status: self.status.clone(),
            metrics: self.metrics,
            thresholds: self.thresholds.clone(),
        }
    }
}

impl CaptureOrchestrator {
    pub fn new(state: Arc<CaptureState>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            state,
            store,
            scopes: Arc::new(AnyScope),
            status: None,
            metrics: CaptureMetrics::new(),
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_scopes(mut self, scopes: Arc<dyn ScopeDirectory>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_status(mut self, publisher: StatusPublisher) -> Self {
        self.status = Some(publisher);
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Captures every target in `request` and returns the aggregate.
    ///
    /// Only a malformed request is an error. Every per-target problem is
    /// reported inside the result, and the batch always runs to completion.
    pub async fn capture_all(
        &self,
        request: CaptureRequest,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<AggregateResult, CaptureError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        request.validate()?;

        if request.targets.is_empty() {
            debug!("Batch {} has no targets", batch_id);
            return Ok(AggregateResult::empty(batch_id));
        }

        if !self.scopes.contains(&request.scope_id).await {
            warn!("Batch {} rejected: unknown scope '{}'", batch_id, request.scope_id);
            return Ok(AggregateResult::empty(batch_id));
        }

        let config = self.state.config.current();
        let total = request.targets.len();
        let deadline = tokio::time::Instant::now() + config.batch_deadline();

        info!(
            "Batch {} started: {} targets for scope {} ({:?} priority)",
            batch_id, total, request.scope_id, request.priority
        );

        let grant = self.state.quota.reserve(total as u64);
        self.metrics.set_quota_used(self.state.quota.usage().used);
        let schedulable = grant.granted as usize;

        let context = BatchContext {
            batch_id: batch_id.clone(),
            scope_id: request.scope_id.clone(),
            priority: request.priority,
            deadline,
            fetcher,
            progress: ProgressTracker::new(total),
        };

        let mut outcomes: Vec<Option<TargetOutcome>> = Vec::with_capacity(total);
        let mut scheduled = Vec::with_capacity(schedulable);
        let mut handles = Vec::with_capacity(schedulable);

        for (index, target) in request.targets.into_iter().enumerate() {
            if index >= schedulable {
                let result = CaptureResult::failed(
                    &target.id,
                    &target.url,
                    FailureCategory::QuotaExceeded,
                    "daily capture quota exhausted",
                    Duration::ZERO,
                    false,
                );
                self.metrics.record_failure(FailureCategory::QuotaExceeded);
                self.publish(&context, &result);
                outcomes.push(Some(TargetOutcome {
                    result,
                    throttled_domain: None,
                }));
                continue;
            }

            let id = target.id.clone();
            let url = target.url.clone();
            let orchestrator = self.clone();
            let task_context = context.clone();
            let handle = tokio::spawn(async move { orchestrator.run_target(target, task_context).await });

            scheduled.push((index, id, url));
            handles.push(handle);
            outcomes.push(None);
        }

        let joined = join_all(handles).await;
        for ((index, id, url), joined) in scheduled.into_iter().zip(joined) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Capture task for {} aborted: {}", id, e);
                    let result = CaptureResult::failed(
                        &id,
                        &url,
                        FailureCategory::Unknown,
                        format!("capture task aborted: {e}"),
                        Duration::ZERO,
                        true,
                    );
                    self.metrics.record_failure(FailureCategory::Unknown);
                    self.publish(&context, &result);
                    TargetOutcome {
                        result,
                        throttled_domain: None,
                    }
                }
            };
            outcomes[index] = Some(outcome);
        }

        let mut results = Vec::with_capacity(total);
        let mut throttled_domains = BTreeSet::new();
        for outcome in outcomes.into_iter().flatten() {
            throttled_domains.extend(outcome.throttled_domain);
            results.push(outcome.result);
        }

        // Scheduled targets that never reached the fetcher give their quota back
        let unattempted = results
            .iter()
            .take(schedulable)
            .filter(|r| !r.attempted)
            .count() as u64;
        if unattempted > 0 {
            debug!("Refunding {} unused quota reservations", unattempted);
            self.state.quota.release(grant.date, unattempted);
            self.metrics.set_quota_used(self.state.quota.usage().used);
        }

        let mut aggregate = AggregateResult::from_results(
            batch_id,
            results,
            context.progress.peak_concurrency(),
            throttled_domains,
            started.elapsed(),
        );
        if self.state.breaker.state() == CircuitState::Open {
            aggregate.circuit_breaker_activated = true;
        }

        info!(
            "Batch {} finished in {}: {} captured, {} skipped, {} failed",
            aggregate.batch_id,
            format_duration(started.elapsed()),
            aggregate.captured_count,
            aggregate.skipped_count,
            aggregate.failed_count
        );

        Ok(aggregate)
    }

    /// Read-only snapshot of the shared state.
    pub fn get_status(&self) -> CaptureStatus {
        CaptureStatus::new(
            self.state.breaker.state(),
            self.state.quota.usage(),
            self.state.throttle.active_domains(),
            (*self.state.config.current()).clone(),
            &self.thresholds,
        )
    }

    /// Validates and installs a config change for all later operations.
    pub fn update_config(&self, partial: &PartialConfig) -> Result<CaptureConfig, CaptureError> {
        let next = self.state.config.update(partial)?;
        info!("Capture config updated: {:?}", partial);
        Ok((*next).clone())
    }

    async fn run_target(self, target: CaptureTarget, context: BatchContext) -> TargetOutcome {
        let outcome = self.capture_target(&target, &context).await;

        let result = &outcome.result;
        if result.attempted {
            self.metrics
                .record_capture(Duration::from_millis(result.duration_ms), result.category());
        } else if let Some(category) = result.category() {
            self.metrics.record_failure(category);
        }
        self.publish(&context, result);

        outcome
    }

    async fn capture_target(&self, target: &CaptureTarget, context: &BatchContext) -> TargetOutcome {
        let started = Instant::now();
        let skipped = |category: FailureCategory, message: &str| TargetOutcome {
            result: CaptureResult::failed(
                &target.id,
                &target.url,
                category,
                message,
                started.elapsed(),
                false,
            ),
            throttled_domain: None,
        };

        let _permit = match timeout_at(context.deadline, self.state.limiter.acquire(&context.scope_id)).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => {
                error!("Permit pool failure for {}: {}", target.id, e);
                return skipped(FailureCategory::Unknown, &e.to_string());
            }
            Err(_) => {
                debug!("Batch deadline reached before {} got a permit", target.id);
                return skipped(
                    FailureCategory::Timeout,
                    "batch deadline reached while waiting for a concurrency slot",
                );
            }
        };

        let profile = complexity::classify(&target.url);

        let pass = match timeout_at(context.deadline, self.state.throttle.acquire(&target.domain)).await {
            Ok(pass) => pass,
            Err(_) => {
                debug!("Batch deadline reached while {} was throttled", target.id);
                return skipped(
                    FailureCategory::Timeout,
                    "batch deadline reached while waiting on the domain throttle",
                );
            }
        };

        let throttled_domain = pass.throttled.then(|| target.domain.clone());

        let Some(ticket) = self.state.breaker.should_allow() else {
            let mut outcome = skipped(FailureCategory::CircuitOpen, "circuit breaker open");
            outcome.throttled_domain = throttled_domain;
            return outcome;
        };

        debug!(
            "Fetching {} ({:?}, timeout {}, waited {})",
            target.url,
            profile.category,
            format_duration(profile.timeout()),
            format_duration(pass.waited)
        );

        if ticket.is_probe() {
            info!("Probing {} for circuit breaker recovery", target.url);
        }

        self.metrics.record_attempt();
        let active = context.progress.start_active();
        let fetch_started = Instant::now();
        let fetched = match timeout(profile.timeout(), context.fetcher.fetch(&target.url, profile.timeout())).await {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(e)) => Err((e.category(), e.to_string())),
            Err(_) => Err((
                FailureCategory::Timeout,
                format!("no response within {}", format_duration(profile.timeout())),
            )),
        };

        let fetch_ok = fetched.is_ok();
        ticket.record(fetch_ok);
        self.state.throttle.record_outcome(&target.domain, fetch_ok);
        drop(active);

        let result = match fetched {
            Ok(page) => match self.store.persist(&target.id, &page.content).await {
                Ok(snapshot) => {
                    CaptureResult::captured(&target.id, &target.url, snapshot, fetch_started.elapsed())
                }
                Err(e) => {
                    match e.severity() {
                        ErrorSeverity::High | ErrorSeverity::Critical => {
                            error!("Captured {} but could not store it: {}", target.id, e)
                        }
                        _ => warn!("Captured {} but could not store it: {}", target.id, e),
                    }
                    CaptureResult::failed(
                        &target.id,
                        &target.url,
                        FailureCategory::Unknown,
                        e.to_string(),
                        fetch_started.elapsed(),
                        true,
                    )
                }
            },
            Err((category, message)) => {
                debug!("Capture of {} failed ({}): {}", target.id, category, message);
                CaptureResult::failed(
                    &target.id,
                    &target.url,
                    category,
                    message,
                    fetch_started.elapsed(),
                    true,
                )
            }
        };

        TargetOutcome {
            result,
            throttled_domain,
        }
    }

    fn publish(&self, context: &BatchContext, result: &CaptureResult) {
        let completed = context.progress.record_completion(result.success);

        let progress = context.progress.get_progress();
        debug!(
            "Batch {}: {}/{} targets done, {} failed, {} in flight, {}",
            context.batch_id,
            progress.completed,
            progress.total,
            progress.errors,
            progress.active,
            format_duration(progress.elapsed)
        );
        if context.progress.is_complete() {
            debug!("Batch {}: every target reported", context.batch_id);
        }

        if let Some(status) = &self.status {
            status.publish(ProgressEvent {
                batch_id: context.batch_id.clone(),
                scope_id: context.scope_id.clone(),
                target_id: result.target_id.clone(),
                priority: context.priority,
                success: result.success,
                category: result.category(),
                duration_ms: result.duration_ms,
                completed,
                total: context.progress.total(),
                timestamp: chrono::Utc::now(),
            });
        }
    }
}
