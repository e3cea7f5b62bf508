use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;

use harvest_core::{
    load_harvest_config, CachedCredential, CredentialCache, FailureRecord, HarvestConfig,
    LimiterScope, RetryPolicy, RunRecord, SessionConfig, TelemetryReader,
};

mod simulate;

pub use simulate::{SimulateArgs, SimulatedRecord, SimulatedSession, SimulationReport};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] harvest_core::ConfigError),
    #[error("invalid settings: {0}")]
    Configuration(#[from] harvest_core::ConfigurationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] harvest_core::TelemetryError),
    #[error("credential error: {0}")]
    Credential(#[from] harvest_core::CredentialError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "harvest session control interface", long_about = None)]
pub struct Cli {
    /// Path to harvest.toml
    #[arg(long, default_value = "configs/harvest.toml")]
    pub config: PathBuf,
    /// Base directory for relative paths in the config
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Override for the credential cache directory
    #[arg(long)]
    pub credentials_dir: Option<PathBuf>,
    /// Override for the failure log
    #[arg(long)]
    pub failure_log: Option<PathBuf>,
    /// Override for the telemetry database
    #[arg(long)]
    pub metrics_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration checks
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Inspect or clear cached login state
    #[command(subcommand)]
    Credentials(CredentialCommands),
    /// Query recorded session failures
    #[command(subcommand)]
    Failures(FailureCommands),
    /// Run a session against synthetic work
    Simulate(SimulateArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate the config, then print the effective settings
    Check,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommands {
    /// List cached accounts
    List,
    /// Show one cached account
    Show(AccountArgs),
    /// Remove one cached account
    Clear(AccountArgs),
}

#[derive(Args, Debug)]
pub struct AccountArgs {
    pub account: String,
}

#[derive(Subcommand, Debug)]
pub enum FailureCommands {
    /// List the most recent failed attempts
    List(FailureListArgs),
}

#[derive(Args, Debug)]
pub struct FailureListArgs {
    /// Maximum number of rows
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Also list the most recent session runs
    #[arg(long, default_value_t = false)]
    pub runs: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "harvestctl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Config(ConfigCommands::Check) => {
            let summary = context.config_summary()?;
            render(&summary, cli.format)?;
        }
        Commands::Credentials(CredentialCommands::List) => {
            let list = context.credential_list()?;
            render(&list, cli.format)?;
        }
        Commands::Credentials(CredentialCommands::Show(args)) => {
            let entry = context.credential_show(&args.account)?;
            render(&entry, cli.format)?;
        }
        Commands::Credentials(CredentialCommands::Clear(args)) => {
            let cleared = context.credential_clear(&args.account)?;
            render(&cleared, cli.format)?;
        }
        Commands::Failures(FailureCommands::List(args)) => {
            let report = context.failure_list(args)?;
            render(&report, cli.format)?;
        }
        Commands::Simulate(args) => {
            let report = context.simulate(args)?;
            render(&report, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: HarvestConfig,
    config_path: PathBuf,
    credentials: CredentialCache,
    failure_log: Option<PathBuf>,
    metrics_db: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_harvest_config(&config_path)?;
        let root = cli.root.clone().unwrap_or_else(|| PathBuf::from("."));

        let credentials = match &cli.credentials_dir {
            Some(dir) => {
                let cache = CredentialCache::new(dir.clone());
                match config.credentials.max_age_hours {
                    Some(hours) => cache.with_max_age_hours(hours),
                    None => cache,
                }
            }
            None => CredentialCache::from_section(&config.credentials, &root),
        };
        let failure_log = cli.failure_log.clone().or_else(|| {
            config
                .observability
                .failure_log
                .as_ref()
                .map(|path| HarvestConfig::resolve_path(&root, path))
        });
        let metrics_db = cli.metrics_db.clone().or_else(|| {
            config
                .observability
                .metrics_db
                .as_ref()
                .map(|path| HarvestConfig::resolve_path(&root, path))
        });

        Ok(Self {
            config,
            config_path,
            credentials,
            failure_log,
            metrics_db,
        })
    }

    fn config_summary(&self) -> Result<ConfigSummary> {
        let session = SessionConfig::from_config(&self.config)?;
        let policy = RetryPolicy::from_section(&self.config.retry)?;
        let backoff_seconds = (2..=policy.max_attempts())
            .map(|attempt| policy.delay_before(attempt).as_secs_f64())
            .collect();
        Ok(ConfigSummary {
            path: self.config_path.clone(),
            requests_per_minute: session.rate_per_minute,
            limiter_scope: self.config.limiter.scope,
            timeout_seconds: session.timeout_seconds,
            work_limit: session.work_limit,
            max_attempts: policy.max_attempts(),
            backoff_seconds,
            worst_case_backoff_seconds: policy.total_backoff().as_secs_f64(),
            credentials_dir: self.credentials.dir().to_path_buf(),
            failure_log: self.failure_log.clone(),
            metrics_db: self.metrics_db.clone(),
        })
    }

    fn credential_list(&self) -> Result<CredentialList> {
        let rows = self
            .credentials
            .entries()?
            .iter()
            .map(|credential| CredentialEntry::new(credential, &self.credentials))
            .collect();
        Ok(CredentialList { rows })
    }

    fn credential_show(&self, account: &str) -> Result<CredentialEntry> {
        let credential = self
            .credentials
            .load(account)?
            .ok_or_else(|| AppError::MissingResource(format!("no cached credential for {account}")))?;
        Ok(CredentialEntry::new(&credential, &self.credentials))
    }

    fn credential_clear(&self, account: &str) -> Result<CredentialCleared> {
        let removed = self.credentials.remove(account)?;
        Ok(CredentialCleared {
            account: account.to_string(),
            removed,
        })
    }

    fn failure_list(&self, args: &FailureListArgs) -> Result<FailureReport> {
        let db = self.metrics_db.as_ref().ok_or_else(|| {
            AppError::MissingResource("no telemetry database configured".to_string())
        })?;
        if !db.exists() {
            return Err(AppError::MissingResource(format!(
                "telemetry database {} not found",
                db.display()
            )));
        }
        let reader = TelemetryReader::open(db)?;
        let failures = reader.recent_failures(args.limit)?;
        let runs = if args.runs {
            reader.recent_runs(args.limit)?
        } else {
            Vec::new()
        };
        Ok(FailureReport { failures, runs })
    }

    fn simulate(&self, args: &SimulateArgs) -> Result<SimulationReport> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(simulate::run_simulation(
            &self.config,
            self.telemetry_paths(),
            args,
        ))
    }

    fn telemetry_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.failure_log, &self.metrics_db) {
            (Some(log), Some(db)) => Some((log.as_path(), db.as_path())),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub path: PathBuf,
    pub requests_per_minute: f64,
    pub limiter_scope: LimiterScope,
    pub timeout_seconds: f64,
    pub work_limit: Option<usize>,
    pub max_attempts: u32,
    pub backoff_seconds: Vec<f64>,
    pub worst_case_backoff_seconds: f64,
    pub credentials_dir: PathBuf,
    pub failure_log: Option<PathBuf>,
    pub metrics_db: Option<PathBuf>,
}

impl DisplayFallback for ConfigSummary {
    fn display(&self) -> String {
        let backoff = self
            .backoff_seconds
            .iter()
            .map(|seconds| format!("{seconds:.2}s"))
            .collect::<Vec<_>>()
            .join(", ");
        let optional = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        [
            format!("Config: {} (valid)", self.path.display()),
            format!(
                "Limiter: {:.1} req/min ({:?})",
                self.requests_per_minute, self.limiter_scope
            ),
            format!(
                "Session: timeout {:.1}s, work limit {}",
                self.timeout_seconds,
                self.work_limit
                    .map(|limit| limit.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
            format!(
                "Retry: {} attempts, backoff [{}], worst case {:.2}s",
                self.max_attempts, backoff, self.worst_case_backoff_seconds
            ),
            format!("Credentials: {}", self.credentials_dir.display()),
            format!("Failure log: {}", optional(&self.failure_log)),
            format!("Metrics DB: {}", optional(&self.metrics_db)),
        ]
        .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CredentialEntry {
    pub account: String,
    pub saved_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub valid: bool,
    pub cookie_names: Vec<String>,
    pub token_names: Vec<String>,
}

impl CredentialEntry {
    fn new(credential: &CachedCredential, cache: &CredentialCache) -> Self {
        Self {
            account: credential.account.clone(),
            saved_at: credential.saved_at,
            expires_at: credential.expires_at,
            valid: cache.validate(credential),
            cookie_names: credential.cookies.keys().cloned().collect(),
            token_names: credential.tokens.keys().cloned().collect(),
        }
    }
}

impl DisplayFallback for CredentialEntry {
    fn display(&self) -> String {
        let expires = self
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} | saved={} | expires={} | {} | cookies={} tokens={}",
            self.account,
            self.saved_at.to_rfc3339(),
            expires,
            if self.valid { "valid" } else { "stale" },
            self.cookie_names.len(),
            self.token_names.len(),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct CredentialList {
    pub rows: Vec<CredentialEntry>,
}

impl DisplayFallback for CredentialList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No cached credentials".to_string();
        }
        self.rows
            .iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CredentialCleared {
    pub account: String,
    pub removed: bool,
}

impl DisplayFallback for CredentialCleared {
    fn display(&self) -> String {
        if self.removed {
            format!("Removed cached credential for {}", self.account)
        } else {
            format!("Nothing cached for {}", self.account)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailureReport {
    pub failures: Vec<FailureRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<RunRecord>,
}

impl DisplayFallback for FailureReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        if self.failures.is_empty() {
            lines.push("No recorded failures".to_string());
        }
        for failure in &self.failures {
            lines.push(format!(
                "{} | {} | {} attempt {} | {} | {:?} | {}",
                failure.timestamp.to_rfc3339(),
                failure.session_id,
                failure.label,
                failure.attempt,
                failure.category,
                failure.action,
                failure.error_message,
            ));
        }
        if !self.runs.is_empty() {
            lines.push("Runs:".to_string());
            for run in &self.runs {
                lines.push(format!(
                    "  {} | {} | {} | records={} errors={} | {}ms",
                    run.timestamp.to_rfc3339(),
                    run.session_id,
                    run.termination_reason,
                    run.records,
                    run.errors_encountered,
                    run.elapsed_ms,
                ));
            }
        }
        lines.join("\n")
    }
}
