use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::resilience::{RetryEvent, RetryObserver, WorkError};

use super::result::{SessionState, SessionSummary};

/// Receives lifecycle events from a running session.
///
/// Every method has a no-op default. Sinks are called inline on the session
/// task and must not block.
pub trait SessionSink: Send + Sync {
    fn on_transition(&self, _session_id: &str, _from: SessionState, _to: SessionState) {}

    fn on_attempt_failed(&self, _session_id: &str, _event: &RetryEvent<'_>) {}

    fn on_unit_skipped(&self, _session_id: &str, _unit: usize, _error: &WorkError) {}

    fn on_session_finished(&self, _summary: &SessionSummary) {}
}

/// Default sink: structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl SessionSink for TracingSink {
    fn on_transition(&self, session_id: &str, from: SessionState, to: SessionState) {
        debug!(session_id, ?from, ?to, "session transition");
    }

    fn on_attempt_failed(&self, session_id: &str, event: &RetryEvent<'_>) {
        debug!(
            session_id,
            label = event.label,
            attempt = event.attempt,
            class = ?event.class,
            error = %event.error,
            "attempt failed"
        );
    }

    fn on_unit_skipped(&self, session_id: &str, unit: usize, error: &WorkError) {
        warn!(session_id, unit, error = %error, "work unit skipped");
    }

    fn on_session_finished(&self, summary: &SessionSummary) {
        info!(
            session_id = %summary.session_id,
            reason = %summary.termination_reason,
            records = summary.record_count,
            errors = summary.errors_encountered,
            elapsed_ms = summary.elapsed_millis,
            "session finished"
        );
    }
}

/// Fans events out to several sinks in order.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn SessionSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn SessionSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SessionSink for SinkSet {
    fn on_transition(&self, session_id: &str, from: SessionState, to: SessionState) {
        for sink in &self.sinks {
            sink.on_transition(session_id, from, to);
        }
    }

    fn on_attempt_failed(&self, session_id: &str, event: &RetryEvent<'_>) {
        for sink in &self.sinks {
            sink.on_attempt_failed(session_id, event);
        }
    }

    fn on_unit_skipped(&self, session_id: &str, unit: usize, error: &WorkError) {
        for sink in &self.sinks {
            sink.on_unit_skipped(session_id, unit, error);
        }
    }

    fn on_session_finished(&self, summary: &SessionSummary) {
        for sink in &self.sinks {
            sink.on_session_finished(summary);
        }
    }
}

/// Forwards retry events from the executor to a session's sink.
pub(crate) struct SinkObserver {
    pub(crate) session_id: String,
    pub(crate) sink: Arc<dyn SessionSink>,
}

impl RetryObserver for SinkObserver {
    fn on_attempt_failed(&self, event: &RetryEvent<'_>) {
        self.sink.on_attempt_failed(&self.session_id, event);
    }
}
