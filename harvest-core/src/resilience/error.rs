use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by a collaborator: resource provider, authenticator, work
/// source, item processor or extraction strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum WorkError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited by remote: {0}")]
    RateLimited(String),
    #[error("blocked by remote: {0}")]
    Blocked(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("resource unavailable: {0}")]
    Resource(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl WorkError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategorizer::categorize(self)
    }
}

/// How the retry executor treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    NetworkTimeout,
    NetworkOther,
    RateLimited,
    BotDetection,
    Authentication,
    ExtractionFailed,
    ResourceUnavailable,
    InvalidInput,
    Permanent,
    Unexpected,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::NetworkTimeout => "network_timeout",
            ErrorCategory::NetworkOther => "network_other",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::BotDetection => "bot_detection",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::ExtractionFailed => "extraction_failed",
            ErrorCategory::ResourceUnavailable => "resource_unavailable",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unexpected => "unexpected",
        }
    }

    pub fn default_class(self) -> ErrorClass {
        match self {
            ErrorCategory::Transient
            | ErrorCategory::NetworkTimeout
            | ErrorCategory::NetworkOther
            | ErrorCategory::RateLimited
            | ErrorCategory::ExtractionFailed
            | ErrorCategory::ResourceUnavailable => ErrorClass::Retryable,
            ErrorCategory::BotDetection
            | ErrorCategory::Authentication
            | ErrorCategory::InvalidInput
            | ErrorCategory::Permanent
            | ErrorCategory::Unexpected => ErrorClass::Fatal,
        }
    }
}

pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn categorize(error: &WorkError) -> ErrorCategory {
        match error {
            WorkError::Transient(_) => ErrorCategory::Transient,
            WorkError::Permanent(_) => ErrorCategory::Permanent,
            WorkError::Timeout(_) => ErrorCategory::NetworkTimeout,
            WorkError::Network(message) => {
                let message = message.to_lowercase();
                if message.contains("captcha")
                    || message.contains("bot")
                    || message.contains("forbidden")
                {
                    ErrorCategory::BotDetection
                } else if message.contains("429") || message.contains("too many requests") {
                    ErrorCategory::RateLimited
                } else if message.contains("timed out") || message.contains("timeout") {
                    ErrorCategory::NetworkTimeout
                } else {
                    ErrorCategory::NetworkOther
                }
            }
            WorkError::RateLimited(_) => ErrorCategory::RateLimited,
            WorkError::Blocked(_) => ErrorCategory::BotDetection,
            WorkError::Authentication(_) => ErrorCategory::Authentication,
            WorkError::Extraction(_) => ErrorCategory::ExtractionFailed,
            WorkError::Resource(_) => ErrorCategory::ResourceUnavailable,
            WorkError::InvalidInput(_) => ErrorCategory::InvalidInput,
            WorkError::Unexpected(message) => {
                if message.to_lowercase().contains("captcha") {
                    ErrorCategory::BotDetection
                } else {
                    ErrorCategory::Unexpected
                }
            }
        }
    }

    /// Default classifier used by [`RetryPolicy`](super::RetryPolicy).
    pub fn classify(error: &WorkError) -> ErrorClass {
        Self::categorize(error).default_class()
    }
}
