#[cfg(test)]
mod integration_tests {
    use crate::fetcher::MockPageFetcher;
    use crate::{
        AggregateResult, CaptureConfig, CaptureError, CaptureOrchestrator, CaptureRequest,
        CaptureState, CaptureTarget, CircuitState, FailureCategory, FetchError, FetchedPage,
        MemorySnapshotStore, PageFetcher, PartialConfig, ProgressEvent, SnapshotRef,
        SnapshotStore, StaticScopes, StatusPublisher, StatusSink,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Fetcher that sleeps for a fixed delay and records concurrency
    #[derive(Default)]
    struct DelayFetcher {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl DelayFetcher {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.starts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageFetcher for DelayFetcher {
        async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, FetchError> {
            self.starts.lock().unwrap().push(Instant::now());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(FetchedPage::new(format!("<html>{url}</html>")))
        }
    }

    struct PanickingFetcher;

    #[async_trait]
    impl PageFetcher for PanickingFetcher {
        async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, FetchError> {
            if url.contains("boom") {
                panic!("fetch engine crashed");
            }
            Ok(FetchedPage::new("ok"))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        async fn persist(&self, _target_id: &str, _content: &[u8]) -> Result<SnapshotRef, CaptureError> {
            Err(CaptureError::Storage("disk full".into()))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        events: tokio::sync::Mutex<Vec<ProgressEvent>>,
    }

    #[async_trait]
    impl StatusSink for CollectingSink {
        async fn publish(&self, event: ProgressEvent) {
            self.events.lock().await.push(event);
        }
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            throttle_ms: 0,
            ..Default::default()
        }
    }

    fn orchestrator(config: CaptureConfig) -> CaptureOrchestrator {
        let state = Arc::new(CaptureState::with_config(config));
        CaptureOrchestrator::new(state, Arc::new(MemorySnapshotStore::new()))
    }

    /// One target per distinct domain
    fn request(scope: &str, count: usize) -> CaptureRequest {
        let targets = (0..count)
            .map(|i| CaptureTarget::new(format!("t{i}"), format!("https://site{i}.example.org/")).unwrap())
            .collect();
        CaptureRequest::new(scope, targets)
    }

    fn same_domain_request(count: usize) -> CaptureRequest {
        let targets = (0..count)
            .map(|i| CaptureTarget::new(format!("t{i}"), format!("https://www.example.com/page{i}")).unwrap())
            .collect();
        CaptureRequest::new("project-1", targets)
    }

    fn assert_counts_add_up(result: &AggregateResult) {
        assert_eq!(
            result.captured_count + result.skipped_count + result.failed_count,
            result.total_targets
        );
        assert_eq!(result.results.len(), result.total_targets);
    }

    #[tokio::test]
    async fn test_global_limit_bounds_concurrency() {
        let orchestrator = orchestrator(CaptureConfig {
            global_concurrency: 2,
            ..test_config()
        });
        let fetcher = DelayFetcher::new(Duration::from_millis(100));

        let result = orchestrator
            .capture_all(request("project-1", 5), fetcher.clone())
            .await
            .unwrap();

        assert_counts_add_up(&result);
        assert_eq!(result.captured_count, 5);
        assert!(result.failures.is_empty());
        assert!(result.resource_usage.peak_concurrency <= 2);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(result.resource_usage.average_capture_ms >= 100.0);
        assert_eq!(result.summary(), "All 5 targets refreshed");
    }

    #[tokio::test]
    async fn test_scope_limit_bounds_concurrency() {
        let orchestrator = orchestrator(CaptureConfig {
            scope_concurrency: 1,
            ..test_config()
        });
        let fetcher = DelayFetcher::new(Duration::from_millis(30));

        let result = orchestrator
            .capture_all(request("project-1", 3), fetcher.clone())
            .await
            .unwrap();

        assert_eq!(result.captured_count, 3);
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
        // Scope limiter is released once the batch is done
        assert_eq!(orchestrator.state().limiter.stats().tracked_scopes, 0);
    }

    #[tokio::test]
    async fn test_same_domain_requests_are_spaced() {
        let orchestrator = orchestrator(CaptureConfig {
            throttle_ms: 1000,
            ..Default::default()
        });
        let fetcher = DelayFetcher::new(Duration::ZERO);
        let started = Instant::now();

        let result = orchestrator
            .capture_all(same_domain_request(3), fetcher.clone())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(result.captured_count, 3);
        assert!(result.resource_usage.throttled_domains.contains("example.com"));

        let mut starts = fetcher.starts.lock().unwrap().clone();
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(950));
        }
    }

    #[tokio::test]
    async fn test_daily_quota_skips_excess_targets() {
        let orchestrator = orchestrator(CaptureConfig {
            daily_limit: 2,
            ..test_config()
        });
        let fetcher = DelayFetcher::new(Duration::ZERO);

        let result = orchestrator
            .capture_all(request("project-1", 5), fetcher.clone())
            .await
            .unwrap();

        assert_counts_add_up(&result);
        assert_eq!(result.captured_count, 2);
        assert_eq!(result.skipped_count, 3);
        assert!(result.rate_limiting_triggered);
        assert_eq!(fetcher.calls(), 2);

        // The tail of the batch is the excess
        let skipped: Vec<&str> = result
            .results
            .iter()
            .filter(|r| r.category() == Some(FailureCategory::QuotaExceeded))
            .map(|r| r.target_id.as_str())
            .collect();
        assert_eq!(skipped, vec!["t2", "t3", "t4"]);
        assert_eq!(result.summary(), "3 of 5 could not be refreshed");

        let status = orchestrator.get_status();
        assert_eq!(status.daily_count, 2);
        assert_eq!(status.daily_limit, 2);
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_next_batch() {
        let orchestrator = orchestrator(test_config());

        let mut failing = MockPageFetcher::new();
        failing
            .expect_fetch()
            .returning(|_, _| Err(FetchError::Network("connection reset".into())));

        let first = orchestrator
            .capture_all(request("project-1", 10), Arc::new(failing))
            .await
            .unwrap();
        assert_counts_add_up(&first);
        assert_eq!(first.captured_count, 0);
        assert_eq!(first.failed_count, 10);
        assert_eq!(orchestrator.state().breaker.state(), CircuitState::Open);

        let mut untouched = MockPageFetcher::new();
        untouched.expect_fetch().times(0);

        let second = orchestrator
            .capture_all(request("project-1", 3), Arc::new(untouched))
            .await
            .unwrap();

        assert_counts_add_up(&second);
        assert!(second.circuit_breaker_activated);
        assert_eq!(second.failed_count, 3);
        assert!(second
            .failures
            .iter()
            .all(|f| f.category == FailureCategory::CircuitOpen));
    }

    fn quick_recovery_config() -> CaptureConfig {
        CaptureConfig {
            breaker_cooldown_ms: 50,
            ..test_config()
        }
    }

    async fn trip_breaker(orchestrator: &CaptureOrchestrator) {
        let mut failing = MockPageFetcher::new();
        failing
            .expect_fetch()
            .returning(|_, _| Err(FetchError::Network("connection reset".into())));

        orchestrator
            .capture_all(request("project-1", 10), Arc::new(failing))
            .await
            .unwrap();
        assert_eq!(orchestrator.state().breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_breaker_recovers_after_successful_probe() {
        let orchestrator = orchestrator(quick_recovery_config());
        trip_breaker(&orchestrator).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Slow enough that the other targets check the breaker while the probe is out
        let fetcher = DelayFetcher::new(Duration::from_millis(100));
        let probe_batch = orchestrator
            .capture_all(request("project-1", 3), fetcher.clone())
            .await
            .unwrap();

        assert_counts_add_up(&probe_batch);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(probe_batch.captured_count, 1);
        assert_eq!(probe_batch.failed_count, 2);
        assert!(probe_batch
            .failures
            .iter()
            .all(|f| f.category == FailureCategory::CircuitOpen));
        assert_eq!(orchestrator.state().breaker.state(), CircuitState::Closed);

        let healthy = orchestrator
            .capture_all(request("project-1", 3), DelayFetcher::new(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(healthy.captured_count, 3);
        assert!(!healthy.circuit_breaker_activated);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_breaker() {
        let orchestrator = orchestrator(quick_recovery_config());
        trip_breaker(&orchestrator).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let mut failing = MockPageFetcher::new();
        failing
            .expect_fetch()
            .times(1)
            .returning(|_, _| Err(FetchError::Timeout(Duration::from_secs(1))));

        let probe_batch = orchestrator
            .capture_all(request("project-1", 1), Arc::new(failing))
            .await
            .unwrap();

        assert_eq!(probe_batch.results[0].category(), Some(FailureCategory::Timeout));
        assert!(probe_batch.circuit_breaker_activated);
        assert_eq!(orchestrator.state().breaker.state(), CircuitState::Open);
        assert_eq!(orchestrator.state().breaker.stats().times_opened, 2);

        let mut untouched = MockPageFetcher::new();
        untouched.expect_fetch().times(0);
        let blocked = orchestrator
            .capture_all(request("project-1", 2), Arc::new(untouched))
            .await
            .unwrap();
        assert_eq!(blocked.failed_count, 2);
    }

    #[tokio::test]
    async fn test_panicking_probe_reopens_breaker() {
        let orchestrator = orchestrator(quick_recovery_config());
        trip_breaker(&orchestrator).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let request_boom = CaptureRequest::new(
            "project-1",
            vec![CaptureTarget::new("bad", "https://boom.example.org").unwrap()],
        );
        let probe_batch = orchestrator
            .capture_all(request_boom, Arc::new(PanickingFetcher))
            .await
            .unwrap();

        assert_eq!(probe_batch.results[0].category(), Some(FailureCategory::Unknown));
        assert_eq!(orchestrator.state().breaker.state(), CircuitState::Open);

        // The breaker is not wedged half-open: the next cooldown admits a new probe
        tokio::time::sleep(Duration::from_millis(80)).await;

        let recovered = orchestrator
            .capture_all(request("project-1", 1), DelayFetcher::new(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(recovered.captured_count, 1);
        assert_eq!(orchestrator.state().breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_categorised() {
        let orchestrator = orchestrator(test_config());

        let mut fetcher = MockPageFetcher::new();
        fetcher.expect_fetch().returning(|url, timeout| {
            if url.contains("site0") {
                Err(FetchError::RateLimited("HTTP 429".into()))
            } else if url.contains("site1") {
                Err(FetchError::Timeout(timeout))
            } else if url.contains("site2") {
                Err(FetchError::Other("HTTP 403 Forbidden".into()))
            } else {
                Ok(FetchedPage::new("ok"))
            }
        });

        let result = orchestrator
            .capture_all(request("project-1", 4), Arc::new(fetcher))
            .await
            .unwrap();

        assert_counts_add_up(&result);
        assert_eq!(result.captured_count, 1);
        assert_eq!(result.results[0].category(), Some(FailureCategory::RateLimited));
        assert_eq!(result.results[1].category(), Some(FailureCategory::Timeout));
        assert_eq!(result.results[2].category(), Some(FailureCategory::Permission));
        assert!(result.results[3].success);
        assert!(result.rate_limiting_triggered);
    }

    #[tokio::test]
    async fn test_deadline_cuts_waiting_targets() {
        let orchestrator = orchestrator(CaptureConfig {
            throttle_ms: 10_000,
            batch_deadline_ms: 300,
            ..Default::default()
        });
        let fetcher = DelayFetcher::new(Duration::ZERO);
        let started = Instant::now();

        let result = orchestrator
            .capture_all(same_domain_request(3), fetcher.clone())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_counts_add_up(&result);
        assert_eq!(result.captured_count, 1);
        assert_eq!(result.failed_count, 2);
        assert!(result
            .failures
            .iter()
            .all(|f| f.category == FailureCategory::Timeout));
        assert_eq!(fetcher.calls(), 1);

        // Targets that never reached the fetcher get their quota back
        assert_eq!(orchestrator.get_status().daily_count, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_unknown_failure() {
        let orchestrator = orchestrator(test_config());
        let request = CaptureRequest::new(
            "project-1",
            vec![
                CaptureTarget::new("ok", "https://fine.example.org").unwrap(),
                CaptureTarget::new("bad", "https://boom.example.org").unwrap(),
            ],
        );

        let result = orchestrator
            .capture_all(request, Arc::new(PanickingFetcher))
            .await
            .unwrap();

        assert_counts_add_up(&result);
        assert_eq!(result.captured_count, 1);
        assert_eq!(result.results[1].category(), Some(FailureCategory::Unknown));
        assert_eq!(orchestrator.state().limiter.global_in_use(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_unknown_failure() {
        let state = Arc::new(CaptureState::with_config(test_config()));
        let orchestrator = CaptureOrchestrator::new(state, Arc::new(FailingStore));

        let result = orchestrator
            .capture_all(request("project-1", 2), DelayFetcher::new(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(result.failed_count, 2);
        assert!(result
            .failures
            .iter()
            .all(|f| f.category == FailureCategory::Unknown));
        // The fetch itself worked, so the breaker saw successes
        assert_eq!(orchestrator.state().breaker.stats().window_failures, 0);
    }

    #[tokio::test]
    async fn test_empty_request_and_unknown_scope() {
        let state = Arc::new(CaptureState::with_config(test_config()));
        let orchestrator = CaptureOrchestrator::new(state, Arc::new(MemorySnapshotStore::new()))
            .with_scopes(Arc::new(StaticScopes::new(["project-1"])));

        let mut fetcher = MockPageFetcher::new();
        fetcher.expect_fetch().times(0);
        let fetcher = Arc::new(fetcher);

        let empty = orchestrator
            .capture_all(CaptureRequest::new("project-1", vec![]), fetcher.clone())
            .await
            .unwrap();
        assert_eq!(empty.total_targets, 0);
        assert_counts_add_up(&empty);

        let unknown = orchestrator
            .capture_all(request("someone-else", 3), fetcher)
            .await
            .unwrap();
        assert_eq!(unknown.total_targets, 0);
        assert_eq!(orchestrator.get_status().daily_count, 0);
    }

    #[tokio::test]
    async fn test_malformed_request_is_rejected() {
        let orchestrator = orchestrator(test_config());
        let request = CaptureRequest::new(
            "project-1",
            vec![
                CaptureTarget::new("dup", "https://a.example.org").unwrap(),
                CaptureTarget::new("dup", "https://b.example.org").unwrap(),
            ],
        );

        let mut fetcher = MockPageFetcher::new();
        fetcher.expect_fetch().times(0);

        let result = orchestrator.capture_all(request, Arc::new(fetcher)).await;
        assert!(matches!(result, Err(CaptureError::Validation(_))));
        assert_eq!(orchestrator.get_status().daily_count, 0);
    }

    #[tokio::test]
    async fn test_status_is_idempotent() {
        let orchestrator = orchestrator(test_config());
        assert_eq!(orchestrator.get_status(), orchestrator.get_status());

        orchestrator
            .capture_all(request("project-1", 3), DelayFetcher::new(Duration::ZERO))
            .await
            .unwrap();

        let first = orchestrator.get_status();
        let second = orchestrator.get_status();
        assert_eq!(first, second);
        assert_eq!(first.daily_count, 3);
        assert_eq!(first.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(first.active_throttled_domains.len(), 3);
    }

    #[tokio::test]
    async fn test_update_config_hot_reload() {
        let orchestrator = orchestrator(test_config());

        let updated = orchestrator
            .update_config(&PartialConfig {
                daily_limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.daily_limit, 1);
        assert_eq!(orchestrator.get_status().current_config.daily_limit, 1);

        let rejected = orchestrator.update_config(&PartialConfig {
            global_concurrency: Some(0),
            ..Default::default()
        });
        assert!(matches!(rejected, Err(CaptureError::Configuration(_))));

        let result = orchestrator
            .capture_all(request("project-1", 3), DelayFetcher::new(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(result.captured_count, 1);
        assert_eq!(result.skipped_count, 2);
    }

    #[tokio::test]
    async fn test_progress_events_published_per_target() {
        let sink = Arc::new(CollectingSink::default());
        let (publisher, drain) = StatusPublisher::spawn(sink.clone(), 64);

        let state = Arc::new(CaptureState::with_config(CaptureConfig {
            daily_limit: 3,
            ..test_config()
        }));
        let orchestrator = CaptureOrchestrator::new(state, Arc::new(MemorySnapshotStore::new()))
            .with_status(publisher);

        let result = orchestrator
            .capture_all(request("project-1", 4), DelayFetcher::new(Duration::ZERO))
            .await
            .unwrap();

        drop(orchestrator);
        drain.await.unwrap();

        let events = sink.events.lock().await;
        assert_eq!(events.len(), result.total_targets);
        assert!(events.iter().all(|e| e.batch_id == result.batch_id));
        assert_eq!(events.iter().filter(|e| e.success).count(), 3);
        let mut completed: Vec<usize> = events.iter().map(|e| e.completed).collect();
        completed.sort();
        assert_eq!(completed, vec![1, 2, 3, 4]);
    }
}
