use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigurationError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HarvestConfig {
    pub session: SessionSection,
    pub limiter: LimiterSection,
    pub retry: RetrySection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
}

impl HarvestConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        let rate = self.limiter.requests_per_minute;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigurationError::InvalidRate(rate));
        }
        let timeout = self.session.timeout_seconds;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ConfigurationError::InvalidBudget(timeout));
        }
        if self.session.work_limit == Some(0) {
            return Err(ConfigurationError::ZeroWorkLimit);
        }
        self.retry.validate()
    }

    /// Resolves paths from the config relative to `base` unless absolute.
    pub fn resolve_path<P: AsRef<Path>>(base: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSection {
    pub timeout_seconds: f64,
    #[serde(default)]
    pub work_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    /// Every session builds its own bucket.
    #[default]
    PerSession,
    /// One bucket shared by all sessions of the process.
    Shared,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterSection {
    pub requests_per_minute: f64,
    #[serde(default)]
    pub scope: LimiterScope,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_seconds: f64,
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub max_delay_seconds: Option<f64>,
    #[serde(default)]
    pub jitter_seconds: f64,
}

impl RetrySection {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn base_delay(&self) -> Duration {
        seconds_to_duration(self.base_delay_seconds)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_seconds.map(seconds_to_duration)
    }

    pub fn jitter(&self) -> Duration {
        seconds_to_duration(self.jitter_seconds)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        check_seconds("base_delay_seconds", self.base_delay_seconds)?;
        check_seconds("jitter_seconds", self.jitter_seconds)?;
        if let Some(max_delay) = self.max_delay_seconds {
            check_seconds("max_delay_seconds", max_delay)?;
        }
        let multiplier = self.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigurationError::InvalidBackoff {
                field: "backoff_multiplier",
                value: multiplier,
            });
        }
        Ok(())
    }
}

/// Accepts only values that fit in a `Duration`.
fn check_seconds(field: &'static str, value: f64) -> std::result::Result<(), ConfigurationError> {
    match Duration::try_from_secs_f64(value) {
        Ok(_) => Ok(()),
        Err(_) => Err(ConfigurationError::InvalidBackoff { field, value }),
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsSection {
    pub cache_dir: String,
    #[serde(default)]
    pub max_age_hours: Option<u64>,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            cache_dir: ".harvest/credentials".to_string(),
            max_age_hours: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObservabilitySection {
    #[serde(default)]
    pub failure_log: Option<String>,
    #[serde(default)]
    pub metrics_db: Option<String>,
}

pub fn load_harvest_config<P: AsRef<Path>>(path: P) -> Result<HarvestConfig> {
    let path = path.as_ref();
    let config: HarvestConfig = load_toml(path)?;
    config.validate().map_err(|source| ConfigError::Invalid {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
