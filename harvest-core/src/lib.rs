pub mod config;
pub mod error;
pub mod resilience;
pub mod session;

pub use config::{
    load_harvest_config, CredentialsSection, HarvestConfig, LimiterScope, LimiterSection,
    ObservabilitySection, RetrySection, SessionSection,
};
pub use error::{ConfigError, ConfigurationError, Result};
pub use resilience::{
    AcquireOutcome, BackoffRetryExecutor, CancelToken, DeadlineBudget, DeadlineExceeded,
    ErrorCategorizer, ErrorCategory, ErrorClass, ErrorCounter, FallbackChain, RetryError,
    RetryEvent, RetryObserver, RetryOutcome, RetryPolicy, Strategy, StrategyChainResult,
    StrategyOutcome, StrategyState, TokenBucketLimiter, WorkError,
};
pub use session::{
    Authenticator, CachedCredential, CachedLoginAuthenticator, CredentialCache, CredentialError,
    FailureRecord, FailureTelemetry, ItemProcessor, IterSource, LoginFlow, ResourceProvider,
    RunRecord, ScopedResource, ScrapeSession, SessionConfig, SessionMetrics, SessionResult,
    SessionSink, SessionState, SessionSummary, SinkSet, TelemetryError, TelemetryReader,
    TerminationReason, TracingSink, UnitOutput, WorkSource,
};
