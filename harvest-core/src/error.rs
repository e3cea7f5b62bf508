use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config {path}: {source}")]
    Invalid {
        source: ConfigurationError,
        path: PathBuf,
    },
}

/// Invalid constructor arguments. Raised at construction time and never
/// folded into a session result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("requests per minute must be positive and finite, got {0}")]
    InvalidRate(f64),
    #[error("acquire timeout must be a non-negative number of seconds, got {0}")]
    InvalidTimeout(f64),
    #[error("deadline budget must be positive and finite, got {0}")]
    InvalidBudget(f64),
    #[error("max attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff {field} is invalid: {value}")]
    InvalidBackoff { field: &'static str, value: f64 },
    #[error("work limit must be positive when set")]
    ZeroWorkLimit,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
