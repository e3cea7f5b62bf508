//! Synthetic sessions for exercising a config without a real site.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clap::Args;
use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use harvest_core::{
    FailureTelemetry, FallbackChain, HarvestConfig, ItemProcessor, IterSource, LimiterScope,
    ResourceProvider, ScrapeSession, SessionConfig, SessionSink, SessionState, SessionSummary,
    SinkSet, TokenBucketLimiter, TracingSink, UnitOutput, WorkError,
};

use crate::{DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of work items per session
    #[arg(long, default_value_t = 10)]
    pub items: usize,
    /// Every Nth item times out once, then needs the fallback strategy
    #[arg(long)]
    pub fail_every: Option<usize>,
    /// Item that gets blocked by the remote and ends the session
    #[arg(long)]
    pub fatal_at: Option<usize>,
    /// Simulated work per attempt, in milliseconds
    #[arg(long, default_value_t = 50)]
    pub unit_ms: u64,
    /// Sessions to run concurrently
    #[arg(long, default_value_t = 1)]
    pub sessions: usize,
    /// Override for the session timeout
    #[arg(long)]
    pub timeout_seconds: Option<f64>,
    /// Override for the retry base delay
    #[arg(long)]
    pub base_delay_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatedRecord {
    pub item: usize,
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct SimulatedSession {
    pub summary: SessionSummary,
    pub history: Vec<SessionState>,
    pub records: Vec<SimulatedRecord>,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub sessions: Vec<SimulatedSession>,
}

impl DisplayFallback for SimulationReport {
    fn display(&self) -> String {
        self.sessions
            .iter()
            .map(|session| {
                let summary = &session.summary;
                let history = session
                    .history
                    .iter()
                    .map(|state| format!("{state:?}"))
                    .collect::<Vec<_>>()
                    .join(" -> ");
                let mut line = format!(
                    "{} | {} | records={} skipped={} errors={} fallbacks={} | {}ms\n  {}",
                    summary.session_id,
                    summary.termination_reason,
                    summary.record_count,
                    summary.items_skipped,
                    summary.errors_encountered,
                    summary.metrics.strategy_fallbacks,
                    summary.elapsed_millis,
                    history,
                );
                if let Some(error) = &summary.fatal_error {
                    line.push_str(&format!("\n  fatal: {error}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct SyntheticProvider;

#[async_trait]
impl ResourceProvider for SyntheticProvider {
    type Resource = String;

    async fn acquire(&self) -> std::result::Result<String, WorkError> {
        Ok("synthetic-page".to_string())
    }
}

struct SyntheticProcessor {
    unit: Duration,
    fail_every: Option<usize>,
    fatal_at: Option<usize>,
    timed_out: Mutex<HashSet<usize>>,
}

impl SyntheticProcessor {
    fn new(args: &SimulateArgs) -> Self {
        Self {
            unit: Duration::from_millis(args.unit_ms),
            fail_every: args.fail_every.filter(|every| *every > 0),
            fatal_at: args.fatal_at,
            timed_out: Mutex::new(HashSet::new()),
        }
    }

    fn degraded(&self, item: usize) -> bool {
        self.fail_every.is_some_and(|every| item % every == 0)
    }

    /// True only the first time an item is seen.
    fn first_attempt(&self, item: usize) -> bool {
        self.timed_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item)
    }
}

#[async_trait]
impl ItemProcessor<String, usize> for SyntheticProcessor {
    type Record = SimulatedRecord;

    async fn process(
        &self,
        _page: &String,
        item: &usize,
    ) -> std::result::Result<UnitOutput<SimulatedRecord>, WorkError> {
        let item = *item;
        tokio::time::sleep(self.unit).await;
        if self.fatal_at == Some(item) {
            return Err(WorkError::Blocked(format!("captcha served on item {item}")));
        }
        let degraded = self.degraded(item);
        if degraded && self.first_attempt(item) {
            return Err(WorkError::Timeout(format!("item {item}")));
        }

        let (records, report) = FallbackChain::new()
            .strategy("primary", move || async move {
                if degraded {
                    Ok(Vec::new())
                } else {
                    Ok(vec![SimulatedRecord {
                        item,
                        strategy: "primary".to_string(),
                    }])
                }
            })
            .strategy("fallback", move || async move {
                Ok(vec![SimulatedRecord {
                    item,
                    strategy: "fallback".to_string(),
                }])
            })
            .run()
            .await;
        Ok(UnitOutput::from_chain(records, report))
    }
}

pub(crate) async fn run_simulation(
    config: &HarvestConfig,
    telemetry: Option<(&Path, &Path)>,
    args: &SimulateArgs,
) -> Result<SimulationReport> {
    let mut session_config = SessionConfig::from_config(config)?;
    if let Some(timeout) = args.timeout_seconds {
        session_config.timeout_seconds = timeout;
    }
    if let Some(base) = args.base_delay_seconds {
        session_config.backoff_base_seconds = base;
    }
    session_config.validate()?;

    let shared_limiter = match config.limiter.scope {
        LimiterScope::Shared => Some(Arc::new(TokenBucketLimiter::new(
            session_config.rate_per_minute,
        )?)),
        LimiterScope::PerSession => None,
    };

    let mut sinks = SinkSet::new();
    sinks.push(Arc::new(TracingSink));
    if let Some((log, db)) = telemetry {
        sinks.push(Arc::new(FailureTelemetry::new(log, db)?));
    }
    let sink: Arc<dyn SessionSink> = Arc::new(sinks);

    let mut runs = Vec::new();
    for index in 0..args.sessions.max(1) {
        let mut session = ScrapeSession::new(
            session_config.clone(),
            SyntheticProvider,
            IterSource::new(1..=args.items),
            SyntheticProcessor::new(args),
        )?
        .with_id(format!("sim-{}", index + 1))
        .with_sink(Arc::clone(&sink));
        if let Some(limiter) = &shared_limiter {
            session = session.with_limiter(Arc::clone(limiter));
        }
        runs.push(session.run());
    }
    info!(sessions = runs.len(), items = args.items, "starting simulation");

    let sessions = join_all(runs)
        .await
        .into_iter()
        .map(|result| SimulatedSession {
            summary: result.summary(),
            history: result.history,
            records: result.records,
        })
        .collect();
    Ok(SimulationReport { sessions })
}
