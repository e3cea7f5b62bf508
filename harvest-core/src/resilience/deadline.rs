use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline of {budget:?} exceeded after {elapsed:?}")]
pub struct DeadlineExceeded {
    pub budget: Duration,
    pub elapsed: Duration,
}

/// Wall-clock ceiling on the work of one session.
///
/// Checks are meant to run between units of work, never inside one, so an
/// exceeded budget never cuts a record in half.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineBudget {
    budget: Duration,
    started_at: Option<Instant>,
}

impl DeadlineBudget {
    pub fn new(budget: Duration) -> Result<Self, ConfigurationError> {
        if budget.is_zero() {
            return Err(ConfigurationError::InvalidBudget(0.0));
        }
        Ok(Self {
            budget,
            started_at: None,
        })
    }

    pub fn from_secs_f64(seconds: f64) -> Result<Self, ConfigurationError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ConfigurationError::InvalidBudget(seconds));
        }
        let budget = Duration::try_from_secs_f64(seconds)
            .map_err(|_| ConfigurationError::InvalidBudget(seconds))?;
        Self::new(budget)
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Zero until [`start`](Self::start) is called.
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn exceeded(&self) -> bool {
        self.elapsed() > self.budget
    }

    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        let elapsed = self.elapsed();
        if elapsed > self.budget {
            Err(DeadlineExceeded {
                budget: self.budget,
                elapsed,
            })
        } else {
            Ok(())
        }
    }

    /// Seconds left in the budget; negative once exceeded.
    pub fn remaining(&self) -> f64 {
        self.budget.as_secs_f64() - self.elapsed().as_secs_f64()
    }

    pub fn remaining_duration(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }
}
