//! Configuration management
//!
//! Configuration is a YAML file (default `config.yaml`) with environment
//! overrides for the database section. The database password should arrive
//! through `PMDA_DB_PASSWORD`; a `database.password` in the file is accepted
//! as a fallback, and the environment variable wins when both are set.

use crate::alert::AlerterConfig;
use crate::dataset::DatasetDescriptor;
use crate::error::{EtlError, Result};
use crate::loader::TieBreak;
use crate::parse::{ParserKind, ParserOptions};
use crate::state::RunMode;
use crate::transform::{ColumnMapping, TransformerKind};
use crate::validate::RuleConfig;
use pmda_common::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Defaults
// ============================================================================

/// Configuration file looked up when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Environment variable holding the database password.
pub const PASSWORD_ENV: &str = "PMDA_DB_PASSWORD";

pub const DEFAULT_DB_HOST: &str = "localhost";
pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_USER: &str = "pmda";
pub const DEFAULT_DB_NAME: &str = "pmda";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CACHE_DIR: &str = "./cache";
pub const DEFAULT_USER_AGENT: &str = concat!("pmda-etl/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FETCH_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 0.5;

/// Minimum spacing between two requests to the same origin, in seconds.
pub const DEFAULT_RATE_LIMIT_SECONDS: f64 = 1.0;

/// How long a cached payload is served without revalidation (1 day).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;

/// Rows per bulk-ingest flush.
pub const DEFAULT_BATCH_SIZE: usize = 5_000;

pub const DEFAULT_TARGET_SCHEMA: &str = "public";

// ============================================================================
// Sections
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub fetch: FetchSettings,
    pub run: RunSettings,
    pub logging: LogConfig,
    pub alerting: Vec<AlerterConfig>,
    pub datasets: BTreeMap<String, DatasetConfig>,
}

/// Supported target engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    #[serde(alias = "postgresql")]
    Postgres,
}

impl std::str::FromStr for DatabaseKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseKind::Postgres),
            other => Err(EtlError::config(format!("unsupported database type: {other}"))),
        }
    }
}

/// Target database connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    /// `PMDA_DB_PASSWORD` wins over a value written here
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// The password came from the file rather than the environment
    #[serde(skip)]
    pub password_from_file: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Postgres,
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            user: DEFAULT_DB_USER.to_string(),
            dbname: DEFAULT_DB_NAME.to_string(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            password: None,
            password_from_file: false,
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("dbname", &self.dbname)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Fetcher, cache and rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSettings {
    pub cache_dir: PathBuf,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub retries: u32,
    pub backoff_factor: f64,
    pub rate_limit_seconds: f64,
    pub cache_ttl_secs: u64,
    /// Entries fetched longer ago than this are evicted when the cache opens
    pub cache_max_age_secs: Option<u64>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            retries: DEFAULT_FETCH_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            rate_limit_seconds: DEFAULT_RATE_LIMIT_SECONDS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_max_age_secs: None,
        }
    }
}

impl FetchSettings {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_max_age(&self) -> Option<Duration> {
        self.cache_max_age_secs.map(Duration::from_secs)
    }
}

/// What to do with a record that fails to parse, transform or validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordErrorPolicy {
    /// Fail the run
    #[default]
    Abort,
    /// Drop the record and count it in `rows_skipped`
    Skip,
}

/// Per-run execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub batch_size: usize,
    pub on_record_error: RecordErrorPolicy,
    /// Cancel a run that takes longer than this
    pub timeout_secs: Option<u64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            on_record_error: RecordErrorPolicy::Abort,
            timeout_secs: None,
        }
    }
}

impl RunSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Where a dataset's resources come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractorConfig {
    /// URL template; may reference `{year}`, `{drug_name}` and `{since}`
    ///
    /// `{since}` is the delta baseline, or `default_epoch` on full runs.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default = "default_target_schema")]
    pub schema: String,
    pub table: String,
}

fn default_target_schema() -> String {
    DEFAULT_TARGET_SCHEMA.to_string()
}

fn default_true() -> bool {
    true
}

/// One `datasets.<name>` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub extractor: ExtractorConfig,
    pub parser: ParserKind,
    #[serde(default)]
    pub parser_options: ParserOptions,
    pub transformer: TransformerKind,
    pub target: TargetConfig,
    pub merge_keys: Vec<String>,
    #[serde(default)]
    pub merge_tie_break: TieBreak,
    #[serde(default)]
    pub watermark_column: Option<String>,
    /// Baseline for a delta run when no successful run exists yet
    #[serde(default)]
    pub default_epoch: Option<serde_json::Value>,
    #[serde(default)]
    pub default_mode: RunMode,
    /// Seconds between requests; overrides `fetch.rate_limit_seconds`
    #[serde(default)]
    pub rate_limit: Option<f64>,
    /// Seconds; overrides `fetch.cache_ttl_secs`
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    /// Full runs bypass the cache
    #[serde(default = "default_true")]
    pub refresh_on_full: bool,
    /// Column mapping for the `mapped` transformer
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub validation: Vec<RuleConfig>,
}

// ============================================================================
// Loading
// ============================================================================

impl AppConfig {
    /// Load `.env`, the YAML file at `path` and the process environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        dotenvy::dotenv().ok();

        let text = std::fs::read_to_string(path).map_err(|e| {
            EtlError::config(format!(
                "cannot read configuration file {}: {e}",
                path.display()
            ))
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml_with_env(&text, |key| std::env::var(key).ok())
    }

    /// Parse `yaml`, apply overrides from `lookup` and validate
    pub fn from_yaml_with_env(yaml: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut raw: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| EtlError::config(format!("configuration is not valid YAML: {e}")))?;

        if raw.is_null() {
            raw = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }

        let mut config: AppConfig = serde_yaml::from_value(raw)
            .map_err(|e| EtlError::config(format!("invalid configuration: {e}")))?;

        config.apply_env(&lookup)?;
        config
            .logging
            .apply_env(&lookup)
            .map_err(|e| EtlError::config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        let db = &mut self.database;

        if let Some(kind) = lookup("PMDA_DB_TYPE") {
            db.kind = kind.parse()?;
        }
        if let Some(host) = lookup("PMDA_DB_HOST") {
            db.host = host;
        }
        if let Some(port) = lookup("PMDA_DB_PORT") {
            db.port = port
                .trim()
                .parse()
                .map_err(|_| EtlError::config(format!("PMDA_DB_PORT is not a valid port: {port}")))?;
        }
        if let Some(user) = lookup("PMDA_DB_USER") {
            db.user = user;
        }
        if let Some(name) = lookup("PMDA_DB_NAME") {
            db.dbname = name;
        }

        let from_file = db.password.take().filter(|p| !p.is_empty());
        match lookup(PASSWORD_ENV).filter(|p| !p.is_empty()) {
            Some(password) => {
                db.password = Some(password);
                db.password_from_file = false;
            }
            None if from_file.is_some() => {
                db.password = from_file;
                db.password_from_file = true;
            }
            None => {
                return Err(EtlError::config(format!(
                    "database password not provided; set the {PASSWORD_ENV} environment variable"
                )))
            }
        }

        Ok(())
    }

    /// Check the configuration's shape without touching the network
    pub fn validate(&self) -> Result<()> {
        if self.database.host.trim().is_empty() {
            return Err(EtlError::config("database.host cannot be empty"));
        }
        if self.database.dbname.trim().is_empty() {
            return Err(EtlError::config("database.dbname cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(EtlError::config(
                "database.max_connections must be greater than 0",
            ));
        }
        if self.run.batch_size == 0 {
            return Err(EtlError::config("run.batch_size must be greater than 0"));
        }
        if !self.fetch.rate_limit_seconds.is_finite() || self.fetch.rate_limit_seconds < 0.0 {
            return Err(EtlError::config(
                "fetch.rate_limit_seconds must be a non-negative number",
            ));
        }
        if !self.fetch.backoff_factor.is_finite() || self.fetch.backoff_factor < 0.0 {
            return Err(EtlError::config(
                "fetch.backoff_factor must be a non-negative number",
            ));
        }

        for alerter in &self.alerting {
            alerter.validate()?;
        }

        for name in self.datasets.keys() {
            self.dataset(name)?;
        }

        Ok(())
    }

    /// Names of all configured datasets, sorted
    pub fn dataset_names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    /// Resolve the descriptor for `name`
    pub fn dataset(&self, name: &str) -> Result<DatasetDescriptor> {
        let entry = self.datasets.get(name).ok_or_else(|| {
            EtlError::config(format!(
                "unknown dataset `{name}`; configured datasets: {}",
                self.dataset_names().join(", ")
            ))
        })?;

        DatasetDescriptor::from_config(name, entry, &self.fetch)
    }
}
