use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

use crate::error::ConfigurationError;

use super::cancel::CancelToken;

/// Floor for a single wait; a float deficit can round down to a zero-length
/// sleep that would never let the clock move.
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    Acquired,
    TimedOut,
    Cancelled,
}

impl AcquireOutcome {
    pub fn is_acquired(self) -> bool {
        matches!(self, AcquireOutcome::Acquired)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// Builds a full bucket holding `requests_per_minute` tokens, or a single
    /// token when the rate is below one per minute.
    pub fn new(requests_per_minute: f64) -> Result<Self, ConfigurationError> {
        if !requests_per_minute.is_finite() || requests_per_minute <= 0.0 {
            return Err(ConfigurationError::InvalidRate(requests_per_minute));
        }
        let capacity = requests_per_minute.max(1.0);
        Ok(Self {
            capacity,
            refill_per_second: requests_per_minute / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_per_second
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }

    fn deficit_wait(&self, tokens: f64) -> Duration {
        if tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - tokens) / self.refill_per_second)
                .unwrap_or(Duration::MAX)
        }
    }

    fn take(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.deficit_wait(state.tokens))
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Waits for a token. `None` waits indefinitely; with a timeout the call
    /// gives up and returns `false` once the timeout has elapsed.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        self.wait_for_token(timeout, None).await.is_acquired()
    }

    /// Like [`acquire`](Self::acquire) with the timeout given in seconds, as it
    /// comes out of configuration. Negative or NaN timeouts are rejected.
    pub async fn acquire_timeout_secs(&self, seconds: f64) -> Result<bool, ConfigurationError> {
        if seconds.is_nan() || seconds < 0.0 {
            return Err(ConfigurationError::InvalidTimeout(seconds));
        }
        let timeout = Duration::try_from_secs_f64(seconds).ok();
        Ok(self.acquire(timeout).await)
    }

    pub async fn acquire_until(
        &self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> AcquireOutcome {
        self.wait_for_token(timeout, Some(cancel)).await
    }

    async fn wait_for_token(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> AcquireOutcome {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return AcquireOutcome::Cancelled;
            }
            let wait = match self.take() {
                Ok(()) => return AcquireOutcome::Acquired,
                Err(wait) => wait.max(MIN_WAIT),
            };
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return AcquireOutcome::TimedOut;
                    }
                    wait.min(deadline - now)
                }
                None => wait,
            };
            trace!(wait_ms = pause.as_millis() as u64, "limiter waiting for token");
            match cancel {
                Some(cancel) => {
                    if !cancel.sleep(pause).await {
                        return AcquireOutcome::Cancelled;
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
        }
    }

    /// Current token count. Applies the pending refill as a side effect.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Current token count without touching the stored refill timestamp.
    pub fn peek_tokens(&self) -> f64 {
        let state = self.lock();
        let elapsed = Instant::now()
            .saturating_duration_since(state.last_refill)
            .as_secs_f64();
        (state.tokens + elapsed * self.refill_per_second).min(self.capacity)
    }

    /// Time until the next token is available; zero when one is ready.
    pub fn wait_time(&self) -> Duration {
        self.deficit_wait(self.peek_tokens())
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }
}
