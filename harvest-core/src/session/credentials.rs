use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CredentialsSection;
use crate::resilience::{FallbackChain, WorkError};

use super::work::Authenticator;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("credential file {path} is malformed: {source}")]
    Malformed {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("account name must not be empty")]
    EmptyAccount,
}

pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub account: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedCredential {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            cookies: BTreeMap::new(),
            tokens: BTreeMap::new(),
            saved_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_token(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tokens.insert(name.into(), value.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CredentialCache {
    dir: PathBuf,
    max_age: ChronoDuration,
}

impl CredentialCache {
    /// A cache whose entries never age out; only their own expiry applies.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_age: ChronoDuration::MAX,
        }
    }

    pub fn with_max_age_hours(mut self, hours: u64) -> Self {
        self.max_age = i64::try_from(hours)
            .ok()
            .and_then(ChronoDuration::try_hours)
            .unwrap_or(ChronoDuration::MAX);
        self
    }

    /// Builds a cache from config; a relative `cache_dir` resolves against
    /// `base`.
    pub fn from_section(section: &CredentialsSection, base: &Path) -> Self {
        let dir = Path::new(&section.cache_dir);
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base.join(dir)
        };
        let cache = Self::new(dir);
        match section.max_age_hours {
            Some(hours) => cache.with_max_age_hours(hours),
            None => cache,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, account: &str) -> CredentialResult<PathBuf> {
        let name = sanitize_account(account)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub fn load(&self, account: &str) -> CredentialResult<Option<CachedCredential>> {
        let path = self.path_for(account)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CredentialError::Io { source, path }),
        };
        let credential = serde_json::from_str(&contents)
            .map_err(|source| CredentialError::Malformed { source, path })?;
        Ok(Some(credential))
    }

    /// A credential is usable when it has not passed its own expiry and is
    /// no older than the cache's maximum age.
    pub fn validate(&self, credential: &CachedCredential) -> bool {
        self.validate_at(credential, Utc::now())
    }

    pub fn validate_at(&self, credential: &CachedCredential, now: DateTime<Utc>) -> bool {
        if credential.expires_at.is_some_and(|expires| now >= expires) {
            return false;
        }
        now.signed_duration_since(credential.saved_at) <= self.max_age
    }

    /// Writes through a temporary file and a rename so a crash never leaves a
    /// half-written credential behind.
    pub fn save(&self, credential: &CachedCredential) -> CredentialResult<PathBuf> {
        let path = self.path_for(&credential.account)?;
        fs::create_dir_all(&self.dir).map_err(|source| CredentialError::Io {
            source,
            path: self.dir.clone(),
        })?;
        let json = serde_json::to_vec_pretty(credential).map_err(|source| {
            CredentialError::Malformed {
                source,
                path: path.clone(),
            }
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| CredentialError::Io {
            source,
            path: tmp.clone(),
        })?;
        fs::rename(&tmp, &path).map_err(|source| CredentialError::Io {
            source,
            path: path.clone(),
        })?;
        debug!(account = %credential.account, path = %path.display(), "credential saved");
        Ok(path)
    }

    pub fn remove(&self, account: &str) -> CredentialResult<bool> {
        let path = self.path_for(account)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CredentialError::Io { source, path }),
        }
    }

    /// Every readable credential in the cache, sorted by account. Malformed
    /// files are logged and skipped.
    pub fn entries(&self) -> CredentialResult<Vec<CachedCredential>> {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CredentialError::Io {
                    source,
                    path: self.dir.clone(),
                })
            }
        };
        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|source| CredentialError::Io {
                source,
                path: self.dir.clone(),
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|error| error.to_string())
                .and_then(|contents| {
                    serde_json::from_str::<CachedCredential>(&contents)
                        .map_err(|error| error.to_string())
                });
            match parsed {
                Ok(credential) => entries.push(credential),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping unreadable credential")
                }
            }
        }
        entries.sort_by(|a, b| a.account.cmp(&b.account));
        Ok(entries)
    }
}

fn sanitize_account(account: &str) -> CredentialResult<String> {
    let trimmed = account.trim();
    if trimmed.is_empty() {
        return Err(CredentialError::EmptyAccount);
    }
    Ok(trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect())
}

#[async_trait]
pub trait LoginFlow<R>: Send + Sync
where
    R: Send + Sync,
{
    /// Restores a cached session on `resource` and confirms it is still
    /// logged in.
    async fn resume(&self, resource: &R, credential: &CachedCredential) -> Result<(), WorkError>;

    async fn login(&self, resource: &R, account: &str) -> Result<CachedCredential, WorkError>;
}

/// Authenticates by resuming a cached session, falling back to a password
/// login.
pub struct CachedLoginAuthenticator<L> {
    account: String,
    cache: CredentialCache,
    flow: L,
}

impl<L> CachedLoginAuthenticator<L> {
    pub fn new(account: impl Into<String>, cache: CredentialCache, flow: L) -> Self {
        Self {
            account: account.into(),
            cache,
            flow,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    fn cached_credential(&self) -> Option<CachedCredential> {
        match self.cache.load(&self.account) {
            Ok(Some(credential)) if self.cache.validate(&credential) => Some(credential),
            Ok(Some(_)) => {
                debug!(account = %self.account, "cached credential expired");
                None
            }
            Ok(None) => None,
            Err(error) => {
                warn!(account = %self.account, error = %error, "ignoring unreadable credential cache");
                None
            }
        }
    }
}

#[async_trait]
impl<R, L> Authenticator<R> for CachedLoginAuthenticator<L>
where
    R: Send + Sync,
    L: LoginFlow<R>,
{
    async fn authenticate(&self, resource: &R) -> Result<(), WorkError> {
        let cached = self.cached_credential();
        let flow = &self.flow;
        let account = self.account.as_str();

        let (mut credentials, report) = FallbackChain::new()
            .strategy("cached_session", move || async move {
                match cached {
                    Some(credential) => {
                        flow.resume(resource, &credential).await?;
                        Ok(vec![credential])
                    }
                    None => Ok(Vec::new()),
                }
            })
            .strategy("password_login", move || async move {
                let credential = flow.login(resource, account).await?;
                Ok(vec![credential])
            })
            .run()
            .await;

        match report.strategy_used() {
            Some("password_login") => {
                if let Some(credential) = credentials.pop() {
                    if let Err(error) = self.cache.save(&credential) {
                        warn!(account, error = %error, "failed to cache credential");
                    }
                }
                info!(account, "authenticated with password login");
                Ok(())
            }
            Some(strategy) => {
                info!(account, strategy, "authenticated");
                Ok(())
            }
            None => Err(report.last_error().cloned().unwrap_or_else(|| {
                WorkError::Authentication(format!("no login strategy succeeded for {account}"))
            })),
        }
    }
}
