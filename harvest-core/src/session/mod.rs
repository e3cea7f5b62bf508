mod credentials;
mod metrics;
mod orchestrator;
mod resource;
mod result;
mod sink;
mod telemetry;
mod work;

pub use credentials::{
    CachedCredential, CachedLoginAuthenticator, CredentialCache, CredentialError,
    CredentialResult, LoginFlow,
};
pub use metrics::SessionMetrics;
pub use orchestrator::{ScrapeSession, SessionConfig};
pub use resource::{ResourceProvider, ScopedResource};
pub use result::{SessionResult, SessionState, SessionSummary, TerminationReason};
pub use sink::{SessionSink, SinkSet, TracingSink};
pub use telemetry::{
    FailureRecord, FailureTelemetry, RemediationAction, RunRecord, TelemetryError,
    TelemetryReader,
};
pub use work::{Authenticator, IterSource, ItemProcessor, UnitOutput, WorkSource};
