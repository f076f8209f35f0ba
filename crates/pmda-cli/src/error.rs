//! Error types for the PMDA CLI
//!
//! Messages are user-facing and say what to check next.

use pmda_etl::EtlError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration is missing or invalid
    #[error("{0}. Check the configuration file and the PMDA_DB_* environment variables.")]
    Config(String),

    /// The target database could not be reached or queried
    #[error("Database error: {0}. Check the database settings and that the server is reachable.")]
    Database(String),

    /// Another process holds the dataset lock
    #[error("Dataset '{0}' is already being loaded by another run. Wait for it to finish, then retry.")]
    Locked(String),

    /// A run was recorded as failed
    #[error("Run {run_id} of '{dataset}' failed during {stage} ({kind}): {message}")]
    RunFailed {
        dataset: String,
        run_id: String,
        stage: String,
        kind: String,
        message: String,
    },

    #[error(transparent)]
    Etl(EtlError),
}

impl From<EtlError> for CliError {
    fn from(err: EtlError) -> Self {
        match err {
            EtlError::Configuration(_) => Self::Config(err.to_string()),
            EtlError::LockContention(dataset) => Self::Locked(dataset),
            EtlError::Database(e) => Self::Database(e.to_string()),
            other => Self::Etl(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_user_messages() {
        let err = CliError::from(EtlError::config("database password not provided"));
        assert!(matches!(err, CliError::Config(_)));
        assert!(err.to_string().contains("PMDA_DB_*"));

        let err = CliError::from(EtlError::LockContention("approvals".into()));
        assert!(err.to_string().contains("'approvals'"));

        let err = CliError::from(EtlError::apply("public.t", "deadlock"));
        assert!(matches!(err, CliError::Etl(_)));
    }
}
