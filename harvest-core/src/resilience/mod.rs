mod cancel;
mod deadline;
mod error;
mod fallback;
mod limiter;
mod retry;

pub use cancel::CancelToken;
pub use deadline::{DeadlineBudget, DeadlineExceeded};
pub use error::{ErrorCategorizer, ErrorCategory, ErrorClass, WorkError};
pub use fallback::{
    FallbackChain, Strategy, StrategyChainResult, StrategyFuture, StrategyOutcome, StrategyState,
};
pub use limiter::{AcquireOutcome, TokenBucketLimiter};
pub use retry::{
    BackoffRetryExecutor, Classifier, ErrorCounter, RetryError, RetryEvent, RetryObserver,
    RetryOutcome, RetryPolicy,
};
