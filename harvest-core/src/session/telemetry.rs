use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::resilience::{ErrorClass, RetryEvent};

use super::result::SessionSummary;
use super::sink::SessionSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    GaveUp,
    Abort,
}

impl RemediationAction {
    fn from_event(event: &RetryEvent<'_>) -> Self {
        match (event.class, event.next_delay) {
            (_, Some(delay)) => RemediationAction::RetryScheduled {
                delay_ms: delay.as_millis() as u64,
            },
            (ErrorClass::Retryable, None) => RemediationAction::GaveUp,
            (ErrorClass::Fatal, None) => RemediationAction::Abort,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RemediationAction::RetryScheduled { .. } => "retry_scheduled",
            RemediationAction::GaveUp => "gave_up",
            RemediationAction::Abort => "abort",
        }
    }

    fn delay_ms(&self) -> Option<u64> {
        match self {
            RemediationAction::RetryScheduled { delay_ms } => Some(*delay_ms),
            _ => None,
        }
    }

    fn from_columns(label: &str, delay_ms: Option<i64>) -> Self {
        match (label, delay_ms) {
            ("retry_scheduled", Some(delay)) => RemediationAction::RetryScheduled {
                delay_ms: u64::try_from(delay).unwrap_or(0),
            },
            ("gave_up", _) => RemediationAction::GaveUp,
            _ => RemediationAction::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub label: String,
    pub category: String,
    pub error_message: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub action: RemediationAction,
}

impl FailureRecord {
    pub fn from_event(session_id: &str, event: &RetryEvent<'_>) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            label: event.label.to_string(),
            category: event.error.category().as_str().to_string(),
            error_message: event.error.to_string(),
            attempt: event.attempt,
            action: RemediationAction::from_event(event),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let action: String = row.get(6)?;
        let delay_ms: Option<i64> = row.get(7)?;
        Ok(Self {
            timestamp: row.get(0)?,
            session_id: row.get(1)?,
            label: row.get(2)?,
            category: row.get(3)?,
            error_message: row.get(4)?,
            attempt: row.get(5)?,
            action: RemediationAction::from_columns(&action, delay_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub termination_reason: String,
    pub records: u64,
    pub errors_encountered: u64,
    pub partial: bool,
    pub elapsed_ms: u64,
    pub fatal_error: Option<String>,
}

impl RunRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let records: i64 = row.get(3)?;
        let errors: i64 = row.get(4)?;
        let partial: i64 = row.get(5)?;
        let elapsed: i64 = row.get(6)?;
        Ok(Self {
            timestamp: row.get(0)?,
            session_id: row.get(1)?,
            termination_reason: row.get(2)?,
            records: records.max(0) as u64,
            errors_encountered: errors.max(0) as u64,
            partial: partial != 0,
            elapsed_ms: elapsed.max(0) as u64,
            fatal_error: row.get(7)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persists failed attempts and finished sessions: a JSON-lines log for
/// tailing and a SQLite database for queries.
#[derive(Debug)]
pub struct FailureTelemetry {
    log: Mutex<File>,
    log_path: PathBuf,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl FailureTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            log_path,
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_failures (
                ts TEXT NOT NULL,
                session_id TEXT NOT NULL,
                label TEXT,
                category TEXT,
                error_message TEXT,
                attempt INTEGER,
                action TEXT,
                retry_delay_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_session_failures_ts ON session_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS session_runs (
                ts TEXT NOT NULL,
                session_id TEXT NOT NULL,
                termination_reason TEXT,
                records INTEGER,
                errors_encountered INTEGER,
                partial INTEGER,
                elapsed_ms INTEGER,
                fatal_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_session_runs_ts ON session_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(failure)?;
        {
            let mut guard = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO session_failures (
                ts, session_id, label, category, error_message, attempt, action, retry_delay_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                failure.timestamp,
                failure.session_id,
                failure.label,
                failure.category,
                failure.error_message,
                failure.attempt,
                failure.action.label(),
                failure.action.delay_ms().map(|delay| delay as i64),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, summary: &SessionSummary) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO session_runs (
                ts, session_id, termination_reason, records, errors_encountered, partial,
                elapsed_ms, fatal_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Utc::now(),
                summary.session_id,
                summary.termination_reason.to_string(),
                summary.record_count as i64,
                summary.errors_encountered as i64,
                if summary.partial { 1 } else { 0 },
                summary.elapsed_millis as i64,
                summary.fatal_error,
            ],
        )?;
        Ok(())
    }

    pub fn reader(&self) -> Result<TelemetryReader, TelemetryError> {
        Ok(TelemetryReader { conn: self.open_db()? })
    }

    /// Most recent failures first.
    pub fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, TelemetryError> {
        self.reader()?.recent_failures(limit)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, TelemetryError> {
        self.reader()?.recent_runs(limit)
    }

    pub fn run_count(&self) -> Result<u64, TelemetryError> {
        self.reader()?.run_count()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

/// Read-only queries over a telemetry database.
pub struct TelemetryReader {
    conn: Connection,
}

impl TelemetryReader {
    /// Opens an existing database without creating it or the failure log.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let conn = Connection::open_with_flags(db_path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    /// Most recent failures first.
    pub fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, TelemetryError> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, session_id, label, category, error_message, attempt, action, retry_delay_ms
             FROM session_failures
             ORDER BY ts DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], FailureRecord::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, TelemetryError> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, session_id, termination_reason, records, errors_encountered, partial,
                    elapsed_ms, fatal_error
             FROM session_runs
             ORDER BY ts DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], RunRecord::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn run_count(&self) -> Result<u64, TelemetryError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM session_runs", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl SessionSink for FailureTelemetry {
    fn on_attempt_failed(&self, session_id: &str, event: &RetryEvent<'_>) {
        let record = FailureRecord::from_event(session_id, event);
        if let Err(error) = self.record_failure(&record) {
            warn!(session_id, error = %error, "failed to persist failure telemetry");
        }
    }

    fn on_session_finished(&self, summary: &SessionSummary) {
        if let Err(error) = self.record_run(summary) {
            warn!(session_id = %summary.session_id, error = %error, "failed to persist run telemetry");
        }
    }
}
