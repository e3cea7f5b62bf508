use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetrySection;
use crate::error::ConfigurationError;

use super::cancel::CancelToken;
use super::error::{ErrorCategorizer, ErrorClass, WorkError};

pub type Classifier = Arc<dyn Fn(&WorkError) -> ErrorClass + Send + Sync>;

/// Immutable description of how an operation is retried.
///
/// The delay before attempt `k` (`k >= 2`) is
/// `base_delay * multiplier^(k - 2)`, optionally capped by `max_delay` and
/// widened by up to `jitter`. Attempt 1 runs immediately.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    jitter: Duration,
    classifier: Classifier,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
    ) -> Result<Self, ConfigurationError> {
        if max_attempts == 0 {
            return Err(ConfigurationError::ZeroAttempts);
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigurationError::InvalidBackoff {
                field: "backoff_multiplier",
                value: multiplier,
            });
        }
        Ok(Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay: None,
            jitter: Duration::ZERO,
            classifier: Arc::new(ErrorCategorizer::classify),
        })
    }

    pub fn from_section(section: &RetrySection) -> Result<Self, ConfigurationError> {
        section.validate()?;
        let mut policy = Self::new(
            section.max_attempts(),
            section.base_delay(),
            section.backoff_multiplier,
        )?
        .with_jitter(section.jitter());
        if let Some(max_delay) = section.max_delay() {
            policy = policy.with_max_delay(max_delay);
        }
        Ok(policy)
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: None,
            jitter: Duration::ZERO,
            classifier: Arc::new(ErrorCategorizer::classify),
        }
    }

    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&WorkError) -> ErrorClass + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_shared_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn classify(&self, error: &WorkError) -> ErrorClass {
        (self.classifier)(error)
    }

    /// Deterministic delay before `attempt` (1-based), without jitter.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn total_backoff(&self) -> Duration {
        (2..=self.max_attempts)
            .map(|attempt| self.delay_before(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() || delay.is_zero() {
            return delay;
        }
        let jitter_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        delay.saturating_add(Duration::from_millis(extra))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts_made: u32,
    pub errors_encountered: u32,
    pub last_error: Option<WorkError>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    #[error("fatal error on attempt {attempts}: {source}")]
    Fatal { attempts: u32, source: WorkError },
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: WorkError,
    },
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        attempts: u32,
        last_error: Option<WorkError>,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<&WorkError> {
        match self {
            RetryError::Fatal { source, .. } => Some(source),
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Process-visible count of failed attempts. Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct ErrorCounter(Arc<AtomicU64>);

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct RetryEvent<'a> {
    pub label: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub class: ErrorClass,
    pub error: &'a WorkError,
    /// Sleep before the next attempt, `None` when no attempt follows.
    pub next_delay: Option<Duration>,
}

pub trait RetryObserver: Send + Sync {
    fn on_attempt_failed(&self, event: &RetryEvent<'_>);
}

#[derive(Clone, Default)]
pub struct BackoffRetryExecutor {
    errors: ErrorCounter,
    cancel: CancelToken,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl fmt::Debug for BackoffRetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffRetryExecutor")
            .field("errors", &self.errors.get())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BackoffRetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_counter(mut self, errors: ErrorCounter) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn error_counter(&self) -> &ErrorCounter {
        &self.errors
    }

    /// Runs `operation` under `policy`. The closure receives the 1-based
    /// attempt number.
    pub async fn execute<F, Fut, T>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WorkError>>,
    {
        let max_attempts = policy.max_attempts();
        let mut attempt = 1u32;
        let mut errors = 0u32;
        let mut last_error: Option<WorkError> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                    last_error,
                });
            }
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(label, attempts = attempt, "operation recovered after retries");
                    }
                    return Ok(RetryOutcome {
                        result,
                        attempts_made: attempt,
                        errors_encountered: errors,
                        last_error,
                    });
                }
                Err(error) => {
                    errors += 1;
                    self.errors.increment();
                    let class = policy.classify(&error);
                    let retrying = class == ErrorClass::Retryable && attempt < max_attempts;
                    let next_delay = retrying
                        .then(|| policy.jittered(policy.delay_before(attempt + 1)));
                    if let Some(observer) = &self.observer {
                        observer.on_attempt_failed(&RetryEvent {
                            label,
                            attempt,
                            max_attempts,
                            class,
                            error: &error,
                            next_delay,
                        });
                    }
                    match (class, next_delay) {
                        (ErrorClass::Fatal, _) => {
                            warn!(label, attempt, error = %error, "fatal error, not retrying");
                            return Err(RetryError::Fatal {
                                attempts: attempt,
                                source: error,
                            });
                        }
                        (ErrorClass::Retryable, None) => {
                            warn!(label, attempts = attempt, error = %error, "retries exhausted");
                            return Err(RetryError::Exhausted {
                                attempts: attempt,
                                last_error: error,
                            });
                        }
                        (ErrorClass::Retryable, Some(delay)) => {
                            warn!(
                                label,
                                attempt,
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "attempt failed, retry scheduled"
                            );
                            last_error = Some(error);
                            if !delay.is_zero() && !self.cancel.sleep(delay).await {
                                return Err(RetryError::Cancelled {
                                    attempts: attempt,
                                    last_error,
                                });
                            }
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn delays_grow_geometrically() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), 3.0).unwrap();
        let delays = (1..=5)
            .map(|attempt| policy.delay_before(attempt))
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1500),
                Duration::from_millis(4500),
                Duration::from_millis(13500),
            ]
        );
        assert_eq!(policy.total_backoff(), Duration::from_millis(20000));
    }

    #[test]
    fn max_delay_caps_backoff() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1), 2.0)
            .unwrap()
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_before(6), Duration::from_secs(5));
    }

    #[test]
    fn rejects_zero_attempts() {
        assert_eq!(
            RetryPolicy::new(0, Duration::from_secs(1), 2.0).unwrap_err(),
            ConfigurationError::ZeroAttempts
        );
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u32, ErrorClass, Option<Duration>)>>,
    }

    impl RetryObserver for Recorder {
        fn on_attempt_failed(&self, event: &RetryEvent<'_>) {
            self.events
                .lock()
                .unwrap()
                .push((event.attempt, event.class, event.next_delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_and_reports_earlier_errors() {
        let recorder = Arc::new(Recorder::default());
        let executor = BackoffRetryExecutor::new().with_observer(recorder.clone());
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0).unwrap();
        let outcome = executor
            .execute("flaky", &policy, |attempt| async move {
                if attempt < 3 {
                    Err(WorkError::Timeout("page".into()))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.result, 30);
        assert_eq!(outcome.attempts_made, 3);
        assert_eq!(outcome.errors_encountered, 2);
        assert_eq!(outcome.last_error, Some(WorkError::Timeout("page".into())));
        assert_eq!(executor.error_counter().get(), 2);
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (1, ErrorClass::Retryable, Some(Duration::from_secs(1))),
                (2, ErrorClass::Retryable, Some(Duration::from_secs(2))),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_overrides_default() {
        let executor = BackoffRetryExecutor::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0)
            .unwrap()
            .with_classifier(|_| ErrorClass::Fatal);
        let err = executor
            .execute("strict", &policy, |_| async {
                Err::<(), _>(WorkError::Transient("blip".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Fatal { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let cancel = CancelToken::new();
        let executor = BackoffRetryExecutor::new().with_cancel(cancel.clone());
        let policy = RetryPolicy::new(5, Duration::from_secs(30), 2.0).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let err = executor
            .execute("slow", &policy, |_| async {
                Err::<(), _>(WorkError::Network("reset".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(err.is_cancelled());
        assert_eq!(err.last_error(), Some(&WorkError::Network("reset".into())));
    }
}
