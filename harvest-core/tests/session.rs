use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use harvest_core::{
    Authenticator, CancelToken, FailureTelemetry, ItemProcessor, IterSource, ResourceProvider,
    ScopedResource, ScrapeSession, SessionConfig, SessionSink, SessionState, TerminationReason,
    TokenBucketLimiter, UnitOutput, WorkError, WorkSource,
};

#[derive(Clone, Default)]
struct CountingProvider {
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    fail_acquire: bool,
}

#[async_trait]
impl ResourceProvider for CountingProvider {
    type Resource = String;

    async fn acquire(&self) -> Result<String, WorkError> {
        if self.fail_acquire {
            return Err(WorkError::Permanent("browser binary missing".into()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(format!("browser-{n}"))
    }

    async fn release(&self, _resource: String) -> Result<(), WorkError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedProcessor {
    unit_time: Duration,
    records_per_item: usize,
    fail: HashMap<u32, WorkError>,
    flaky: Mutex<HashSet<u32>>,
    panic_on: Option<u32>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProcessor {
    fn new() -> Self {
        Self {
            unit_time: Duration::ZERO,
            records_per_item: 1,
            fail: HashMap::new(),
            flaky: Mutex::new(HashSet::new()),
            panic_on: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn taking(mut self, unit_time: Duration) -> Self {
        self.unit_time = unit_time;
        self
    }

    fn failing(mut self, item: u32, error: WorkError) -> Self {
        self.fail.insert(item, error);
        self
    }

    fn flaky_once(self, item: u32) -> Self {
        self.flaky.lock().unwrap().insert(item);
        self
    }
}

#[async_trait]
impl ItemProcessor<String, u32> for ScriptedProcessor {
    type Record = String;

    async fn process(&self, _resource: &String, item: &u32) -> Result<UnitOutput<String>, WorkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.unit_time.is_zero() {
            tokio::time::sleep(self.unit_time).await;
        }
        if self.panic_on == Some(*item) {
            let selectors: Vec<&str> = Vec::new();
            return Ok(vec![selectors[0].to_string()].into());
        }
        if let Some(error) = self.fail.get(item) {
            return Err(error.clone());
        }
        let flaky = self.flaky.lock().unwrap().remove(item);
        if flaky {
            return Err(WorkError::Timeout(format!("item {item}")));
        }
        Ok((0..self.records_per_item)
            .map(|n| format!("{item}-{n}"))
            .collect::<Vec<_>>()
            .into())
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        rate_per_minute: 6000.0,
        timeout_seconds: 60.0,
        max_retries: 2,
        backoff_base_seconds: 0.1,
        ..SessionConfig::default()
    }
}

fn session(
    config: SessionConfig,
    provider: &CountingProvider,
    items: impl IntoIterator<Item = u32>,
    processor: ScriptedProcessor,
) -> ScrapeSession<CountingProvider, IterSource<u32>, ScriptedProcessor> {
    ScrapeSession::new(config, provider.clone(), IterSource::new(items), processor).unwrap()
}

#[tokio::test(start_paused = true)]
async fn completes_in_source_order() {
    let provider = CountingProvider::default();
    let result = session(fast_config(), &provider, 0..3, ScriptedProcessor::new())
        .run()
        .await;

    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert!(!result.partial);
    assert_eq!(result.records, vec!["0-0", "1-0", "2-0"]);
    assert_eq!(result.record_count, 3);
    assert_eq!(result.items_processed, 3);
    assert_eq!(result.errors_encountered, 0);
    assert_eq!(
        result.history,
        vec![
            SessionState::Created,
            SessionState::ResourceAcquired,
            SessionState::Running,
            SessionState::Completed,
            SessionState::Closed,
        ]
    );
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_ends_session_with_partial_records() {
    let provider = CountingProvider::default();
    let config = SessionConfig {
        timeout_seconds: 1.0,
        ..fast_config()
    };
    let processor = ScriptedProcessor::new().taking(Duration::from_secs(1));
    let result = session(config, &provider, 0..5, processor).run().await;

    assert_eq!(result.termination_reason, TerminationReason::TimedOut);
    assert!(result.partial);
    assert!(!result.records.is_empty());
    assert!(result.records.len() < 5);
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_unit_keeps_records_and_releases_once() {
    let provider = CountingProvider::default();
    let processor =
        ScriptedProcessor::new().failing(2, WorkError::Blocked("account suspended".into()));
    let calls = processor.calls.clone();
    let result = session(fast_config(), &provider, 0..5, processor).run().await;

    assert_eq!(result.termination_reason, TerminationReason::Fatal);
    assert!(result.partial);
    assert_eq!(result.records, vec!["0-0", "1-0"]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(result
        .fatal_error
        .as_deref()
        .is_some_and(|message| message.contains("account suspended")));
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_close_releases_once() {
    let provider = CountingProvider::default();
    let resource = provider.acquire().await.unwrap();
    let mut scoped = ScopedResource::new(&provider, resource);
    assert!(scoped.close().await);
    assert!(!scoped.close().await);
    assert!(!scoped.close().await);
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_unit_adds_attempts_to_errors() {
    let provider = CountingProvider::default();
    let processor =
        ScriptedProcessor::new().failing(1, WorkError::Network("connection reset".into()));
    let result = session(fast_config(), &provider, 0..4, processor).run().await;

    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.records, vec!["0-0", "2-0", "3-0"]);
    assert_eq!(result.items_skipped, 1);
    assert_eq!(result.items_processed, 3);
    assert_eq!(result.errors_encountered, 3);
    assert_eq!(result.metrics.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn flaky_unit_recovers() {
    let provider = CountingProvider::default();
    let processor = ScriptedProcessor::new().flaky_once(1);
    let result = session(fast_config(), &provider, 0..3, processor).run().await;

    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.records.len(), 3);
    assert_eq!(result.errors_encountered, 1);
    assert_eq!(result.metrics.retries, 1);
    assert_eq!(result.metrics.units_succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn panicking_unit_is_fatal_and_still_releases() {
    let provider = CountingProvider::default();
    let mut processor = ScriptedProcessor::new();
    processor.panic_on = Some(1);
    let result = session(fast_config(), &provider, 0..3, processor).run().await;

    assert_eq!(result.termination_reason, TerminationReason::Fatal);
    assert_eq!(result.records, vec!["0-0"]);
    assert!(result
        .fatal_error
        .as_deref()
        .is_some_and(|message| message.contains("panicked")));
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_returns_accumulated_records() {
    let provider = CountingProvider::default();
    let processor = ScriptedProcessor::new().taking(Duration::from_secs(1));
    let session = session(fast_config(), &provider, 0..10, processor);
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
    });
    let result = session.run().await;

    assert_eq!(result.termination_reason, TerminationReason::Cancelled);
    assert_eq!(result.records.len(), 3);
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_run_future_skips_release() {
    let provider = CountingProvider::default();
    let processor = ScriptedProcessor::new().taking(Duration::from_secs(1));
    let run = session(fast_config(), &provider, 0..10, processor).run();

    assert!(tokio::time::timeout(Duration::from_millis(2500), run)
        .await
        .is_err());
    assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(provider.released.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_backoff() {
    let provider = CountingProvider::default();
    let config = SessionConfig {
        max_retries: 5,
        backoff_base_seconds: 30.0,
        ..fast_config()
    };
    let processor = ScriptedProcessor::new().failing(0, WorkError::Transient("busy".into()));
    let cancel = CancelToken::new();
    let session = session(config, &provider, 0..2, processor).with_cancel_token(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });
    let started = tokio::time::Instant::now();
    let result = session.run().await;

    assert_eq!(result.termination_reason, TerminationReason::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

struct ScriptedAuth {
    failures_before_success: AtomicUsize,
    error: WorkError,
}

#[async_trait]
impl Authenticator<String> for ScriptedAuth {
    async fn authenticate(&self, _resource: &String) -> Result<(), WorkError> {
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        self.failures_before_success
            .store(remaining - 1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn fatal_authentication_never_runs() {
    let provider = CountingProvider::default();
    let processor = ScriptedProcessor::new();
    let calls = processor.calls.clone();
    let result = session(fast_config(), &provider, 0..3, processor)
        .with_authenticator(ScriptedAuth {
            failures_before_success: AtomicUsize::new(usize::MAX),
            error: WorkError::Authentication("wrong password".into()),
        })
        .run()
        .await;

    assert_eq!(result.termination_reason, TerminationReason::Fatal);
    assert!(!result.history.contains(&SessionState::Running));
    assert!(!result.history.contains(&SessionState::Authenticated));
    assert_eq!(result.auth_attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retryable_authentication_recovers() {
    let provider = CountingProvider::default();
    let result = session(fast_config(), &provider, 0..2, ScriptedProcessor::new())
        .with_authenticator(ScriptedAuth {
            failures_before_success: AtomicUsize::new(1),
            error: WorkError::Network("login page timed out".into()),
        })
        .run()
        .await;

    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.auth_attempts, 2);
    assert_eq!(
        &result.history[..4],
        &[
            SessionState::Created,
            SessionState::ResourceAcquired,
            SessionState::Authenticated,
            SessionState::Running,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_acquisition_is_fatal_without_release() {
    let provider = CountingProvider {
        fail_acquire: true,
        ..Default::default()
    };
    let result = session(fast_config(), &provider, 0..2, ScriptedProcessor::new())
        .run()
        .await;

    assert_eq!(result.termination_reason, TerminationReason::Fatal);
    assert_eq!(
        result.history,
        vec![
            SessionState::Created,
            SessionState::Fatal,
            SessionState::Closed
        ]
    );
    assert_eq!(provider.released.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn work_limit_truncates_records() {
    let provider = CountingProvider::default();
    let config = SessionConfig {
        work_limit: Some(3),
        ..fast_config()
    };
    let mut processor = ScriptedProcessor::new();
    processor.records_per_item = 2;
    let calls = processor.calls.clone();
    let result = session(config, &provider, 0..10, processor).run().await;

    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.records, vec!["0-0", "0-1", "1-0"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct BrokenFeed {
    served: bool,
}

#[async_trait]
impl WorkSource for BrokenFeed {
    type Item = u32;

    async fn next_item(&mut self) -> Result<Option<u32>, WorkError> {
        if self.served {
            Err(WorkError::Network("feed closed".into()))
        } else {
            self.served = true;
            Ok(Some(7))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn work_source_error_is_fatal() {
    let provider = CountingProvider::default();
    let result = ScrapeSession::new(
        fast_config(),
        provider.clone(),
        BrokenFeed { served: false },
        ScriptedProcessor::new(),
    )
    .unwrap()
    .run()
    .await;

    assert_eq!(result.termination_reason, TerminationReason::Fatal);
    assert_eq!(result.records, vec!["7-0"]);
    assert!(result
        .fatal_error
        .as_deref()
        .is_some_and(|message| message.contains("feed closed")));
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shared_limiter_throttles_across_sessions() {
    let limiter = Arc::new(TokenBucketLimiter::new(2.0).unwrap());
    let config = SessionConfig {
        timeout_seconds: 10.0,
        ..fast_config()
    };
    let provider = CountingProvider::default();

    let first = session(config.clone(), &provider, 0..2, ScriptedProcessor::new())
        .with_limiter(limiter.clone())
        .run()
        .await;
    let second = session(config, &provider, 0..2, ScriptedProcessor::new())
        .with_limiter(limiter.clone())
        .run()
        .await;

    assert_eq!(first.termination_reason, TerminationReason::Completed);
    assert_eq!(first.records.len(), 2);
    assert_eq!(second.termination_reason, TerminationReason::TimedOut);
    assert!(second.records.is_empty());
    assert_eq!(provider.released.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn sub_one_rate_session_makes_progress() {
    let provider = CountingProvider::default();
    let config = SessionConfig {
        rate_per_minute: 0.5,
        timeout_seconds: 3600.0,
        ..fast_config()
    };
    let result = session(config, &provider, 0..2, ScriptedProcessor::new())
        .run()
        .await;

    assert_eq!(result.termination_reason, TerminationReason::Completed);
    assert_eq!(result.records, vec!["0-0", "1-0"]);
    assert!(result.elapsed_millis >= 119_000, "{}", result.elapsed_millis);
}

#[derive(Clone, Default)]
struct SharedQueue(Arc<Mutex<VecDeque<u32>>>);

#[async_trait]
impl WorkSource for SharedQueue {
    type Item = u32;

    async fn next_item(&mut self) -> Result<Option<u32>, WorkError> {
        Ok(self.0.lock().unwrap().pop_front())
    }

    fn requeue(&mut self, item: u32) {
        self.0.lock().unwrap().push_front(item);
    }
}

#[tokio::test(start_paused = true)]
async fn limiter_timeout_leaves_item_in_source() {
    let limiter = Arc::new(TokenBucketLimiter::new(2.0).unwrap());
    while limiter.try_acquire() {}
    let queue = SharedQueue::default();
    queue.0.lock().unwrap().extend([5, 6]);
    let provider = CountingProvider::default();
    let processor = ScriptedProcessor::new();
    let calls = processor.calls.clone();

    let result = ScrapeSession::new(
        SessionConfig {
            timeout_seconds: 10.0,
            ..fast_config()
        },
        provider.clone(),
        queue.clone(),
        processor,
    )
    .unwrap()
    .with_limiter(limiter)
    .run()
    .await;

    assert_eq!(result.termination_reason, TerminationReason::TimedOut);
    assert!(result.records.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(*queue.0.lock().unwrap(), VecDeque::from([5, 6]));
}

#[tokio::test(start_paused = true)]
async fn cancel_at_limiter_leaves_item_in_source() {
    let limiter = Arc::new(TokenBucketLimiter::new(1.0).unwrap());
    assert!(limiter.try_acquire());
    let queue = SharedQueue::default();
    queue.0.lock().unwrap().push_back(9);
    let provider = CountingProvider::default();
    let session = ScrapeSession::new(
        fast_config(),
        provider.clone(),
        queue.clone(),
        ScriptedProcessor::new(),
    )
    .unwrap()
    .with_limiter(limiter);
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let result = session.run().await;

    assert_eq!(result.termination_reason, TerminationReason::Cancelled);
    assert_eq!(*queue.0.lock().unwrap(), VecDeque::from([9]));
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct TransitionLog(Mutex<Vec<(SessionState, SessionState)>>);

impl SessionSink for TransitionLog {
    fn on_transition(&self, _session_id: &str, from: SessionState, to: SessionState) {
        self.0.lock().unwrap().push((from, to));
    }
}

#[tokio::test(start_paused = true)]
async fn sinks_observe_transitions_and_failures() {
    let dir = tempdir().unwrap();
    let telemetry = Arc::new(
        FailureTelemetry::new(dir.path().join("failures.log"), dir.path().join("metrics.db"))
            .unwrap(),
    );
    let log = Arc::new(TransitionLog::default());
    let mut sinks = harvest_core::SinkSet::new();
    sinks.push(telemetry.clone());
    sinks.push(log.clone());

    let provider = CountingProvider::default();
    let result = session(
        fast_config(),
        &provider,
        0..2,
        ScriptedProcessor::new().flaky_once(0),
    )
    .with_id("session-under-test")
    .with_sink(Arc::new(sinks))
    .run()
    .await;

    assert_eq!(result.session_id, "session-under-test");
    let failures = telemetry.recent_failures(10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].label, "unit:0");
    assert_eq!(failures[0].session_id, "session-under-test");
    assert_eq!(telemetry.run_count().unwrap(), 1);

    let transitions = log.0.lock().unwrap().clone();
    assert_eq!(transitions.first(), Some(&(SessionState::Created, SessionState::ResourceAcquired)));
    assert_eq!(transitions.last(), Some(&(SessionState::Completed, SessionState::Closed)));
}

#[tokio::test(start_paused = true)]
async fn result_serializes_for_downstream_consumers() {
    let provider = CountingProvider::default();
    let result = session(fast_config(), &provider, 0..1, ScriptedProcessor::new())
        .run()
        .await;
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["termination_reason"], "completed");
    assert_eq!(json["records"][0], "0-0");
    assert_eq!(json["partial"], false);
}
