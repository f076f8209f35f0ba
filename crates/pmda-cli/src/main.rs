//! PMDA CLI - Main entry point

use clap::Parser;
use pmda_cli::{Cli, CliError, Commands};
use pmda_common::logging::{init_logging, LogConfig, LogLevel};
use pmda_etl::config::AppConfig;
use pmda_etl::CancellationToken;
use std::process;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config file when it loads
    let loaded = AppConfig::load(&cli.config);
    let mut log_config = match &loaded {
        Ok(config) => config.logging.clone(),
        Err(_) => LogConfig::from_env().unwrap_or_default(),
    };
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        }
    };

    let result = match loaded {
        Ok(config) => {
            if config.database.password_from_file {
                warn!(
                    "database.password is read from {}; prefer the PMDA_DB_PASSWORD environment variable",
                    cli.config.display()
                );
            }
            execute_command(cli, config).await
        }
        Err(e) => Err(CliError::from(e)),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Execute the CLI command
async fn execute_command(cli: Cli, config: AppConfig) -> pmda_cli::Result<()> {
    match cli.command {
        Commands::InitDb => pmda_cli::commands::init_db::run(config).await,

        Commands::Run(args) => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling the run");
                    on_signal.cancel();
                }
            });
            pmda_cli::commands::run::run(config, args, cancel).await
        }

        Commands::Status { dataset, limit } => {
            pmda_cli::commands::status::run(config, dataset, limit).await
        }

        Commands::CheckConfig => pmda_cli::commands::check_config::run(config).await,
    }
}
