use std::collections::VecDeque;

use async_trait::async_trait;

use crate::resilience::{StrategyChainResult, WorkError};

#[async_trait]
pub trait Authenticator<R>: Send + Sync
where
    R: Send + Sync,
{
    async fn authenticate(&self, resource: &R) -> Result<(), WorkError>;
}

/// Yields work items in order. `Ok(None)` means the source is exhausted.
#[async_trait]
pub trait WorkSource: Send {
    type Item: Send + Sync;

    async fn next_item(&mut self) -> Result<Option<Self::Item>, WorkError>;

    /// Takes back an item the session pulled but never ran, because the
    /// deadline or a cancel hit while it waited for the limiter. The default
    /// discards it.
    fn requeue(&mut self, _item: Self::Item) {}
}

#[derive(Debug, Clone)]
pub struct IterSource<I> {
    items: VecDeque<I>,
}

impl<I> IterSource<I> {
    pub fn new(items: impl IntoIterator<Item = I>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl<I: Send + Sync> WorkSource for IterSource<I> {
    type Item = I;

    async fn next_item(&mut self) -> Result<Option<I>, WorkError> {
        Ok(self.items.pop_front())
    }

    fn requeue(&mut self, item: I) {
        self.items.push_front(item);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutput<T> {
    pub records: Vec<T>,
    pub strategies: Option<StrategyChainResult>,
}

impl<T> UnitOutput<T> {
    pub fn from_chain(records: Vec<T>, report: StrategyChainResult) -> Self {
        Self {
            records,
            strategies: Some(report),
        }
    }

    /// Strategies that failed before the one that produced the records.
    pub fn fallbacks(&self) -> usize {
        self.strategies
            .as_ref()
            .filter(|report| report.succeeded())
            .map(|report| report.failures().count())
            .unwrap_or(0)
    }
}

impl<T> From<Vec<T>> for UnitOutput<T> {
    fn from(records: Vec<T>) -> Self {
        Self {
            records,
            strategies: None,
        }
    }
}

#[async_trait]
pub trait ItemProcessor<R, I>: Send + Sync
where
    R: Send + Sync,
    I: Send + Sync,
{
    type Record: Send;

    async fn process(&self, resource: &R, item: &I) -> Result<UnitOutput<Self::Record>, WorkError>;
}
