use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub units_attempted: u64,
    pub units_succeeded: u64,
    pub units_skipped: u64,
    pub records_collected: u64,
    pub retries: u64,
    pub limiter_waits: u64,
    pub limiter_wait_ms: u64,
    pub auth_attempts: u64,
    pub strategy_fallbacks: u64,
}

impl SessionMetrics {
    pub fn record_unit_attempt(&mut self) {
        self.units_attempted = self.units_attempted.saturating_add(1);
    }

    pub fn record_unit_success(&mut self, records: usize, attempts: u32) {
        self.units_succeeded = self.units_succeeded.saturating_add(1);
        self.records_collected = self.records_collected.saturating_add(records as u64);
        self.record_retries(attempts);
    }

    pub fn record_unit_skipped(&mut self, attempts: u32) {
        self.units_skipped = self.units_skipped.saturating_add(1);
        self.record_retries(attempts);
    }

    pub fn record_retries(&mut self, attempts: u32) {
        let retries = u64::from(attempts.saturating_sub(1));
        self.retries = self.retries.saturating_add(retries);
    }

    pub fn record_limiter_wait(&mut self, waited_ms: u64) {
        if waited_ms > 0 {
            self.limiter_waits = self.limiter_waits.saturating_add(1);
            self.limiter_wait_ms = self.limiter_wait_ms.saturating_add(waited_ms);
        }
    }

    pub fn record_auth_attempts(&mut self, attempts: u32) {
        self.auth_attempts = self.auth_attempts.saturating_add(u64::from(attempts));
        self.record_retries(attempts);
    }

    /// Counts the strategies that failed before the one that produced records.
    pub fn record_strategy_fallbacks(&mut self, failed_strategies: usize) {
        self.strategy_fallbacks = self
            .strategy_fallbacks
            .saturating_add(failed_strategies as u64);
    }

    pub fn success_rate(&self) -> f64 {
        if self.units_attempted == 0 {
            0.0
        } else {
            (self.units_succeeded as f64 / self.units_attempted as f64) * 100.0
        }
    }
}
