use std::fmt;

use serde::{Deserialize, Serialize};

use super::metrics::SessionMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    TimedOut,
    Fatal,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminationReason::Completed => "completed",
            TerminationReason::TimedOut => "timed_out",
            TerminationReason::Fatal => "fatal",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a [`ScrapeSession`](super::ScrapeSession).
///
/// ```text
/// Created → ResourceAcquired → [Authenticated] → Running
///         → {Completed, TimedOut, Fatal, Cancelled} → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    ResourceAcquired,
    Authenticated,
    Running,
    Completed,
    TimedOut,
    Fatal,
    Cancelled,
    Closed,
}

impl From<TerminationReason> for SessionState {
    fn from(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::Completed => SessionState::Completed,
            TerminationReason::TimedOut => SessionState::TimedOut,
            TerminationReason::Fatal => SessionState::Fatal,
            TerminationReason::Cancelled => SessionState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResult<T> {
    pub session_id: String,
    /// Records in work-source order.
    pub records: Vec<T>,
    pub record_count: usize,
    /// Failed attempts across acquisition, authentication and work units.
    pub errors_encountered: u64,
    pub partial: bool,
    pub termination_reason: TerminationReason,
    pub elapsed_millis: u64,
    pub items_processed: usize,
    pub items_skipped: usize,
    pub auth_attempts: u32,
    pub fatal_error: Option<String>,
    pub history: Vec<SessionState>,
    pub metrics: SessionMetrics,
}

impl<T> SessionResult<T> {
    pub(crate) fn new(session_id: String) -> Self {
        Self {
            session_id,
            records: Vec::new(),
            record_count: 0,
            errors_encountered: 0,
            partial: true,
            termination_reason: TerminationReason::Fatal,
            elapsed_millis: 0,
            items_processed: 0,
            items_skipped: 0,
            auth_attempts: 0,
            fatal_error: None,
            history: vec![SessionState::Created],
            metrics: SessionMetrics::default(),
        }
    }

    pub(crate) fn finalize(
        &mut self,
        reason: TerminationReason,
        errors_encountered: u64,
        elapsed_millis: u64,
    ) {
        self.termination_reason = reason;
        self.partial = reason != TerminationReason::Completed;
        self.errors_encountered = errors_encountered;
        self.elapsed_millis = elapsed_millis;
        self.record_count = self.records.len();
    }

    pub fn is_complete(&self) -> bool {
        !self.partial
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            record_count: self.records.len(),
            errors_encountered: self.errors_encountered,
            partial: self.partial,
            termination_reason: self.termination_reason,
            elapsed_millis: self.elapsed_millis,
            items_processed: self.items_processed,
            items_skipped: self.items_skipped,
            auth_attempts: self.auth_attempts,
            fatal_error: self.fatal_error.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// A [`SessionResult`] without its records, for sinks and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub record_count: usize,
    pub errors_encountered: u64,
    pub partial: bool,
    pub termination_reason: TerminationReason,
    pub elapsed_millis: u64,
    pub items_processed: usize,
    pub items_skipped: usize,
    pub auth_attempts: u32,
    pub fatal_error: Option<String>,
    pub metrics: SessionMetrics,
}
