use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{HarvestConfig, RetrySection};
use crate::error::ConfigurationError;
use crate::resilience::{
    AcquireOutcome, BackoffRetryExecutor, CancelToken, DeadlineBudget, ErrorClass, ErrorCounter,
    RetryError, RetryPolicy, TokenBucketLimiter, WorkError,
};

use super::resource::{ResourceProvider, ScopedResource};
use super::result::{SessionResult, SessionState, TerminationReason};
use super::sink::{SessionSink, SinkObserver, TracingSink};
use super::work::{Authenticator, ItemProcessor, WorkSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub rate_per_minute: f64,
    pub timeout_seconds: f64,
    pub max_retries: u32,
    pub work_limit: Option<usize>,
    pub backoff_base_seconds: f64,
    pub backoff_multiplier: f64,
    pub max_backoff_seconds: Option<f64>,
    pub jitter_seconds: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 60.0,
            timeout_seconds: 600.0,
            max_retries: 3,
            work_limit: None,
            backoff_base_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_backoff_seconds: None,
            jitter_seconds: 0.0,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &HarvestConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            rate_per_minute: config.limiter.requests_per_minute,
            timeout_seconds: config.session.timeout_seconds,
            max_retries: config.retry.max_retries,
            work_limit: config.session.work_limit,
            backoff_base_seconds: config.retry.base_delay_seconds,
            backoff_multiplier: config.retry.backoff_multiplier,
            max_backoff_seconds: config.retry.max_delay_seconds,
            jitter_seconds: config.retry.jitter_seconds,
        })
    }

    fn retry_section(&self) -> RetrySection {
        RetrySection {
            max_retries: self.max_retries,
            base_delay_seconds: self.backoff_base_seconds,
            backoff_multiplier: self.backoff_multiplier,
            max_delay_seconds: self.max_backoff_seconds,
            jitter_seconds: self.jitter_seconds,
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigurationError> {
        RetryPolicy::from_section(&self.retry_section())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        TokenBucketLimiter::new(self.rate_per_minute)?;
        DeadlineBudget::from_secs_f64(self.timeout_seconds)?;
        if self.work_limit == Some(0) {
            return Err(ConfigurationError::ZeroWorkLimit);
        }
        self.retry_section().validate()
    }
}

struct Termination {
    reason: TerminationReason,
    error: Option<String>,
}

impl Termination {
    fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            reason: TerminationReason::Fatal,
            error: Some(message),
        }
    }

    fn from_retry(stage: &str, error: RetryError) -> Self {
        if error.is_cancelled() {
            Self::new(TerminationReason::Cancelled)
        } else {
            Self::fatal(format!("{stage}: {error}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a bounded, rate-limited unit-of-work loop against one acquired
/// resource.
///
/// [`run`](Self::run) always returns a [`SessionResult`]; records gathered
/// before a timeout, fatal error, cancellation or panic are kept and the
/// resource is released exactly once on every path.
pub struct ScrapeSession<P, S, W>
where
    P: ResourceProvider,
    S: WorkSource,
    W: ItemProcessor<P::Resource, S::Item>,
{
    id: String,
    config: SessionConfig,
    policy: RetryPolicy,
    deadline: DeadlineBudget,
    limiter: Arc<TokenBucketLimiter>,
    provider: P,
    source: S,
    processor: W,
    authenticator: Option<Box<dyn Authenticator<P::Resource>>>,
    sink: Arc<dyn SessionSink>,
    cancel: CancelToken,
    errors: ErrorCounter,
}

impl<P, S, W> ScrapeSession<P, S, W>
where
    P: ResourceProvider,
    S: WorkSource,
    W: ItemProcessor<P::Resource, S::Item>,
{
    pub fn new(
        config: SessionConfig,
        provider: P,
        source: S,
        processor: W,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let limiter = Arc::new(TokenBucketLimiter::new(config.rate_per_minute)?);
        let deadline = DeadlineBudget::from_secs_f64(config.timeout_seconds)?;
        let policy = config.retry_policy()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config,
            policy,
            deadline,
            limiter,
            provider,
            source,
            processor,
            authenticator: None,
            sink: Arc::new(TracingSink),
            cancel: CancelToken::new(),
            errors: ErrorCounter::new(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_authenticator<A>(mut self, authenticator: A) -> Self
    where
        A: Authenticator<P::Resource> + 'static,
    {
        self.authenticator = Some(Box::new(authenticator));
        self
    }

    /// Shares a limiter with other sessions instead of the session's own.
    pub fn with_limiter(mut self, limiter: Arc<TokenBucketLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&WorkError) -> ErrorClass + Send + Sync + 'static,
    {
        self.policy = self.policy.with_classifier(classifier);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Counter of failed attempts for this session; clones observe it live.
    pub fn error_counter(&self) -> ErrorCounter {
        self.errors.clone()
    }

    /// Drives the session to a terminal state and returns its result.
    ///
    /// Release is async, so it only happens when this future runs to
    /// completion. Dropping the future (an outer `tokio::time::timeout` or a
    /// losing `select!` branch) skips the release and only logs a warning. To
    /// stop a session early, cancel its [`cancel_token`](Self::cancel_token)
    /// and await the result instead.
    pub async fn run(self) -> SessionResult<W::Record> {
        let Self {
            id,
            config,
            policy,
            deadline,
            limiter,
            provider,
            mut source,
            processor,
            authenticator,
            sink,
            cancel,
            errors,
        } = self;
        let started = Instant::now();
        info!(session_id = %id, rate_per_minute = config.rate_per_minute, timeout_s = config.timeout_seconds, "session starting");

        let executor = BackoffRetryExecutor::new()
            .with_error_counter(errors.clone())
            .with_cancel(cancel.clone())
            .with_observer(Arc::new(SinkObserver {
                session_id: id.clone(),
                sink: sink.clone(),
            }));
        let mut runner = Runner {
            session_id: &id,
            executor: &executor,
            policy: &policy,
            limiter: &limiter,
            cancel: &cancel,
            sink: sink.as_ref(),
            authenticator: authenticator.as_deref(),
            work_limit: config.work_limit,
            source: &mut source,
            processor: &processor,
            deadline,
            state: SessionState::Created,
            result: SessionResult::new(id.clone()),
        };

        let acquired = executor
            .execute("acquire_resource", &policy, |_| provider.acquire())
            .await;
        let termination = match acquired {
            Err(error) => Termination::from_retry("resource acquisition", error),
            Ok(outcome) => {
                runner.transition(SessionState::ResourceAcquired);
                let mut scoped = ScopedResource::new(&provider, outcome.result);
                let termination = match scoped.get() {
                    Some(resource) => AssertUnwindSafe(runner.drive(resource))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            warn!(session_id = %id, panic = %message, "work unit panicked");
                            Termination::fatal(format!("work unit panicked: {message}"))
                        }),
                    None => Termination::fatal("resource released before use".to_string()),
                };
                scoped.close().await;
                termination
            }
        };

        runner.transition(termination.reason.into());
        runner.transition(SessionState::Closed);
        let mut result = runner.result;
        result.fatal_error = termination.error;
        let elapsed_millis = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        result.finalize(termination.reason, errors.get(), elapsed_millis);

        info!(
            session_id = %id,
            reason = %result.termination_reason,
            records = result.record_count,
            processed = result.items_processed,
            skipped = result.items_skipped,
            errors = result.errors_encountered,
            elapsed_ms = result.elapsed_millis,
            "session closed"
        );
        sink.on_session_finished(&result.summary());
        result
    }
}

struct Runner<'a, R, S, W>
where
    R: Send + Sync,
    S: WorkSource,
    W: ItemProcessor<R, S::Item>,
{
    session_id: &'a str,
    executor: &'a BackoffRetryExecutor,
    policy: &'a RetryPolicy,
    limiter: &'a TokenBucketLimiter,
    cancel: &'a CancelToken,
    sink: &'a dyn SessionSink,
    authenticator: Option<&'a dyn Authenticator<R>>,
    work_limit: Option<usize>,
    source: &'a mut S,
    processor: &'a W,
    deadline: DeadlineBudget,
    state: SessionState,
    result: SessionResult<W::Record>,
}

impl<'a, R, S, W> Runner<'a, R, S, W>
where
    R: Send + Sync,
    S: WorkSource,
    W: ItemProcessor<R, S::Item>,
{
    fn transition(&mut self, to: SessionState) {
        self.sink.on_transition(self.session_id, self.state, to);
        self.state = to;
        self.result.history.push(to);
    }

    fn limit_reached(&self) -> bool {
        self.work_limit
            .is_some_and(|limit| self.result.records.len() >= limit)
    }

    async fn authenticate(&mut self, resource: &R) -> Result<(), Termination> {
        let Some(authenticator) = self.authenticator else {
            return Ok(());
        };
        let outcome = self
            .executor
            .execute("authenticate", self.policy, move |_| {
                authenticator.authenticate(resource)
            })
            .await;
        let attempts = match &outcome {
            Ok(outcome) => outcome.attempts_made,
            Err(error) => error.attempts(),
        };
        self.result.auth_attempts = attempts;
        self.result.metrics.record_auth_attempts(attempts);
        match outcome {
            Ok(_) => {
                self.transition(SessionState::Authenticated);
                Ok(())
            }
            Err(error) => Err(Termination::from_retry("authentication", error)),
        }
    }

    async fn drive(&mut self, resource: &R) -> Termination {
        if let Err(termination) = self.authenticate(resource).await {
            return termination;
        }

        self.deadline.start();
        self.transition(SessionState::Running);
        let mut unit = 0usize;
        loop {
            if self.limit_reached() {
                info!(session_id = self.session_id, "work limit reached");
                return Termination::new(TerminationReason::Completed);
            }
            if self.cancel.is_cancelled() {
                return Termination::new(TerminationReason::Cancelled);
            }
            if let Err(exceeded) = self.deadline.check() {
                info!(session_id = self.session_id, error = %exceeded, "deadline reached");
                return Termination::new(TerminationReason::TimedOut);
            }

            let item = match self.source.next_item().await {
                Ok(Some(item)) => item,
                Ok(None) => return Termination::new(TerminationReason::Completed),
                Err(error) => {
                    self.executor.error_counter().increment();
                    return Termination::fatal(format!("work source: {error}"));
                }
            };

            let waiting_since = Instant::now();
            let admission = self
                .limiter
                .acquire_until(Some(self.deadline.remaining_duration()), self.cancel)
                .await;
            match admission {
                AcquireOutcome::Acquired => {
                    let waited = waiting_since.elapsed().as_millis().min(u128::from(u64::MAX));
                    self.result.metrics.record_limiter_wait(waited as u64);
                }
                AcquireOutcome::TimedOut => {
                    info!(session_id = self.session_id, unit, "deadline reached waiting for limiter");
                    self.source.requeue(item);
                    return Termination::new(TerminationReason::TimedOut);
                }
                AcquireOutcome::Cancelled => {
                    info!(session_id = self.session_id, unit, "cancelled waiting for limiter");
                    self.source.requeue(item);
                    return Termination::new(TerminationReason::Cancelled);
                }
            }

            self.result.metrics.record_unit_attempt();
            let label = format!("unit:{unit}");
            let processor = self.processor;
            let item = &item;
            let outcome = self
                .executor
                .execute(&label, self.policy, move |_| processor.process(resource, item))
                .await;
            match outcome {
                Ok(outcome) => {
                    let output = outcome.result;
                    let metrics = &mut self.result.metrics;
                    metrics.record_strategy_fallbacks(output.fallbacks());
                    metrics.record_unit_success(output.records.len(), outcome.attempts_made);
                    self.result.records.extend(output.records);
                    if let Some(limit) = self.work_limit {
                        self.result.records.truncate(limit);
                    }
                    self.result.items_processed += 1;
                }
                Err(RetryError::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    self.result.metrics.record_unit_skipped(attempts);
                    self.result.items_skipped += 1;
                    self.sink.on_unit_skipped(self.session_id, unit, &last_error);
                }
                Err(error) => return Termination::from_retry(&label, error),
            }
            unit += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = SessionConfig {
            timeout_seconds: 0.0,
            ..SessionConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigurationError::InvalidBudget(0.0)));

        let config = SessionConfig {
            work_limit: Some(0),
            ..SessionConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigurationError::ZeroWorkLimit));
    }

    #[test]
    fn oversized_backoff_is_a_configuration_error() {
        let config = SessionConfig {
            backoff_base_seconds: 1e300,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidBackoff {
                field: "base_delay_seconds",
                ..
            })
        ));
        assert!(config.retry_policy().is_err());
    }

    #[test]
    fn retry_policy_follows_config() {
        let config = SessionConfig {
            max_retries: 2,
            backoff_base_seconds: 0.5,
            backoff_multiplier: 3.0,
            max_backoff_seconds: Some(1.0),
            ..SessionConfig::default()
        };
        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_before(2), Duration::from_millis(500));
        assert_eq!(policy.delay_before(3), Duration::from_secs(1));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(payload.as_ref()), "index out of bounds");
        let payload: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
