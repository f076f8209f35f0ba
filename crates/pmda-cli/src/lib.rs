//! PMDA CLI Library
//!
//! Command-line interface for the PMDA ETL engine.
//!
//! - **Schema**: create the run state tables (`pmda init-db`)
//! - **Runs**: load one dataset in full or delta mode (`pmda run`)
//! - **Status**: latest runs and failures per dataset (`pmda status`)
//! - **Configuration**: validate settings and connectivity (`pmda check-config`)

pub mod commands;
pub mod error;

pub use error::{CliError, Result};

use clap::{Parser, Subcommand, ValueEnum};
use pmda_etl::state::RunMode;
use std::path::PathBuf;

/// PMDA - regulatory data loader
#[derive(Parser, Debug)]
#[command(name = "pmda")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file
    #[arg(
        short,
        long,
        env = "PMDA_CONFIG",
        default_value = "config.yaml",
        global = true
    )]
    pub config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the run state schema in the target database (idempotent)
    InitDb,

    /// Run the pipeline for one dataset
    Run(RunArgs),

    /// Show the latest runs per dataset, or one dataset's history
    Status {
        /// Show recent history of this dataset only
        #[arg(short, long)]
        dataset: Option<String>,

        /// Number of history entries with --dataset
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },

    /// Validate configuration and database connectivity without changing anything
    CheckConfig,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Dataset name as configured under `datasets:`
    #[arg(short, long)]
    pub dataset: String,

    /// Load mode; defaults to the dataset's `default_mode`
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Value for the `{year}` placeholder of the source URL
    #[arg(long)]
    pub year: Option<i32>,

    /// Value for the `{drug_name}` placeholder; repeat for several resources
    #[arg(long = "drug-name", value_name = "NAME")]
    pub drug_names: Vec<String>,

    /// Bypass the download cache
    #[arg(long)]
    pub refresh: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Full,
    Delta,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => RunMode::Full,
            ModeArg::Delta => RunMode::Delta,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "pmda",
            "run",
            "--dataset",
            "package_inserts",
            "--mode",
            "delta",
            "--drug-name",
            "ロキソニン",
            "--drug-name",
            "aspirin",
            "--refresh",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.dataset, "package_inserts");
        assert_eq!(args.mode.map(RunMode::from), Some(RunMode::Delta));
        assert_eq!(args.drug_names, vec!["ロキソニン", "aspirin"]);
        assert!(args.refresh);
        assert_eq!(args.year, None);
    }

    #[test]
    fn test_status_defaults() {
        let cli = Cli::try_parse_from(["pmda", "status"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Status {
                dataset: None,
                limit: 10
            }
        ));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["pmda", "run", "-d", "x", "--mode", "partial"]).is_err());
    }
}
