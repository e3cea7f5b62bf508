use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::debug;

use super::error::WorkError;

pub type StrategyFuture<'a, T> = BoxFuture<'a, Result<Vec<T>, WorkError>>;

pub struct Strategy<'a, T> {
    name: String,
    run: Box<dyn FnOnce() -> StrategyFuture<'a, T> + Send + 'a>,
}

impl<'a, T: Send + 'a> Strategy<'a, T> {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<Vec<T>, WorkError>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move || run().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyState {
    NotTried,
    Succeeded,
    /// Errored, panicked, timed out, or returned nothing.
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyOutcome {
    pub name: String,
    pub state: StrategyState,
    pub records: usize,
    /// `None` on a failed strategy means it ran cleanly but found nothing.
    pub error: Option<WorkError>,
}

impl StrategyOutcome {
    fn new(name: String, state: StrategyState) -> Self {
        Self {
            name,
            state,
            records: 0,
            error: None,
        }
    }

    pub fn attempted(&self) -> bool {
        matches!(self.state, StrategyState::Succeeded | StrategyState::Failed)
    }

    pub fn succeeded(&self) -> bool {
        self.state == StrategyState::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyChainResult {
    pub strategy_index_used: Option<usize>,
    pub records: usize,
    pub outcomes: Vec<StrategyOutcome>,
}

impl StrategyChainResult {
    pub fn succeeded(&self) -> bool {
        self.strategy_index_used.is_some()
    }

    pub fn strategy_used(&self) -> Option<&str> {
        self.strategy_index_used
            .and_then(|index| self.outcomes.get(index))
            .map(|outcome| outcome.name.as_str())
    }

    /// Error of the last strategy that raised one, if any did.
    pub fn last_error(&self) -> Option<&WorkError> {
        self.outcomes
            .iter()
            .rev()
            .find_map(|outcome| outcome.error.as_ref())
    }

    pub fn failures(&self) -> impl Iterator<Item = &StrategyOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == StrategyState::Failed)
    }
}

pub struct FallbackChain<'a, T> {
    strategies: Vec<Strategy<'a, T>>,
    strategy_timeout: Option<Duration>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            strategy_timeout: None,
        }
    }

    pub fn strategy<F, Fut>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<Vec<T>, WorkError>> + Send + 'a,
    {
        self.strategies.push(Strategy::new(name, run));
        self
    }

    pub fn push(&mut self, strategy: Strategy<'a, T>) {
        self.strategies.push(strategy);
    }

    /// Bounds each strategy; one that overruns is marked failed with a
    /// timeout error.
    pub fn with_strategy_timeout(mut self, timeout: Duration) -> Self {
        self.strategy_timeout = Some(timeout);
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn describe(&self) -> Vec<StrategyOutcome> {
        self.strategies
            .iter()
            .map(|strategy| StrategyOutcome::new(strategy.name.clone(), StrategyState::NotTried))
            .collect()
    }

    pub async fn run(self) -> (Vec<T>, StrategyChainResult) {
        let mut outcomes = Vec::with_capacity(self.strategies.len());
        let mut strategy_index_used = None;
        let mut records = Vec::new();

        for (index, strategy) in self.strategies.into_iter().enumerate() {
            if strategy_index_used.is_some() {
                outcomes.push(StrategyOutcome::new(strategy.name, StrategyState::Skipped));
                continue;
            }

            let Strategy { name, run } = strategy;
            let future = AssertUnwindSafe(run()).catch_unwind();
            let result = match self.strategy_timeout {
                Some(limit) => match tokio::time::timeout(limit, future).await {
                    Ok(result) => result,
                    Err(_) => Ok(Err(WorkError::Timeout(format!(
                        "strategy {name} after {limit:?}"
                    )))),
                },
                None => future.await,
            };

            let mut outcome = StrategyOutcome::new(name, StrategyState::Failed);
            match result {
                Ok(Ok(found)) if !found.is_empty() => {
                    debug!(strategy = %outcome.name, index, records = found.len(), "strategy succeeded");
                    outcome.state = StrategyState::Succeeded;
                    outcome.records = found.len();
                    strategy_index_used = Some(index);
                    records = found;
                }
                Ok(Ok(_)) => {
                    debug!(strategy = %outcome.name, index, "strategy found nothing");
                }
                Ok(Err(error)) => {
                    debug!(strategy = %outcome.name, index, error = %error, "strategy failed");
                    outcome.error = Some(error);
                }
                Err(_) => {
                    debug!(strategy = %outcome.name, index, "strategy panicked");
                    outcome.error = Some(WorkError::Unexpected(format!(
                        "strategy {} panicked",
                        outcome.name
                    )));
                }
            }
            outcomes.push(outcome);
        }

        let report = StrategyChainResult {
            strategy_index_used,
            records: records.len(),
            outcomes,
        };
        (records, report)
    }
}

impl<'a, T: Send + 'a> Default for FallbackChain<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}
