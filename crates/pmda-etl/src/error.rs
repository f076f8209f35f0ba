//! Error taxonomy for pipeline runs
//!
//! Every failure that can end a run maps onto one [`EtlError`] variant. The
//! variant decides how the orchestrator reacts (retry, skip-or-abort, fail
//! fast) and its [`EtlError::kind`] is what lands in the run record.

use crate::orchestrator::Stage;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// Invalid or incomplete configuration, always detected before a run starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote resource could not be retrieved
    #[error("Fetch failed for {url}: {message}")]
    Fetch {
        url: String,
        message: String,
        retryable: bool,
    },

    /// Payload bytes could not be turned into records
    #[error("Parse error: {message}")]
    Parse {
        /// 1-based record position, `None` when the payload as a whole is unreadable
        record: Option<u64>,
        message: String,
    },

    /// A raw record could not be mapped onto the target schema
    #[error("Transform error at record {record}: {message}")]
    Transform { record: u64, message: String },

    /// A transformed row broke a configured data quality rule
    #[error("Validation rule '{rule}' failed at record {record}: {message}")]
    Validation {
        record: u64,
        rule: String,
        message: String,
    },

    /// A row does not fit the declared column schema
    #[error("Data integrity violation in {table}: {message}")]
    DataIntegrity { table: String, message: String },

    /// Staged rows could not be applied; the target table is unchanged
    #[error("Apply to {table} failed: {message}")]
    Apply { table: String, message: String },

    /// Another run already holds the dataset lock
    #[error("Dataset '{0}' is already being loaded by another run")]
    LockContention(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Run state store misuse or corruption
    #[error("Run state error: {0}")]
    State(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn fetch(url: impl Into<String>, msg: impl Into<String>, retryable: bool) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
            retryable,
        }
    }

    pub fn parse(record: Option<u64>, msg: impl Into<String>) -> Self {
        Self::Parse {
            record,
            message: msg.into(),
        }
    }

    pub fn transform(record: u64, msg: impl Into<String>) -> Self {
        Self::Transform {
            record,
            message: msg.into(),
        }
    }

    pub fn validation(record: u64, rule: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            record,
            rule: rule.into(),
            message: msg.into(),
        }
    }

    pub fn integrity(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DataIntegrity {
            table: table.into(),
            message: msg.into(),
        }
    }

    pub fn apply(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            table: table.into(),
            message: msg.into(),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Stable identifier recorded in the run record's failure summary
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Fetch { .. } => "fetch_error",
            Self::Parse { .. } => "parse_error",
            Self::Transform { .. } => "transform_error",
            Self::Validation { .. } => "validation_error",
            Self::DataIntegrity { .. } => "data_integrity_error",
            Self::Apply { .. } => "apply_error",
            Self::LockContention(_) => "lock_contention_error",
            Self::Cancelled(_) => "cancelled",
            Self::State(_) => "state_error",
            Self::Cache(_) => "cache_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Pipeline stage an error belongs to, when the variant implies one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Configuration(_) | Self::LockContention(_) => Some(Stage::Initializing),
            Self::Fetch { .. } | Self::Cache(_) => Some(Stage::Fetching),
            Self::Parse { .. } => Some(Stage::Parsing),
            Self::Transform { .. } | Self::Validation { .. } => Some(Stage::Transforming),
            Self::DataIntegrity { .. } => Some(Stage::Staging),
            Self::Apply { .. } => Some(Stage::Applying),
            _ => None,
        }
    }

    /// Whether a retry of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { retryable: true, .. })
    }

    /// Errors confined to a single record, subject to the skip-or-abort policy
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::Parse {
                record: Some(_),
                ..
            } | Self::Transform { .. }
                | Self::Validation { .. }
        )
    }
}
