//! `pmda run` command implementation

use crate::error::{CliError, Result};
use crate::RunArgs;
use colored::Colorize;
use pmda_etl::config::AppConfig;
use pmda_etl::engine::Engine;
use pmda_etl::orchestrator::RunOutcome;
use pmda_etl::source::RunParams;
use pmda_etl::CancellationToken;
use serde_json::Value;

/// Run one dataset; a failed run becomes an error so the process exits nonzero
pub async fn run(config: AppConfig, args: RunArgs, cancel: CancellationToken) -> Result<()> {
    // unknown datasets fail before a connection is attempted
    config.dataset(&args.dataset)?;

    let engine = Engine::connect(config).await?;
    let params = RunParams {
        year: args.year,
        drug_names: args.drug_names,
        force_refresh: args.refresh,
    };

    let outcome = engine
        .run_dataset(&args.dataset, args.mode.map(Into::into), params, cancel)
        .await?;

    report(&outcome)
}

fn report(outcome: &RunOutcome) -> Result<()> {
    if let Some(failure) = &outcome.failure {
        return Err(CliError::RunFailed {
            dataset: outcome.dataset.clone(),
            run_id: outcome.run_id.to_string(),
            stage: failure.stage.clone(),
            kind: failure.kind.clone(),
            message: failure.message.clone(),
        });
    }

    println!(
        "{} {} ({} run {})",
        "✓".green(),
        outcome.dataset.bold(),
        outcome.mode,
        outcome.run_id
    );
    println!("  Rows loaded:  {}", outcome.rows_loaded);
    if outcome.rows_skipped > 0 {
        println!("  Rows skipped: {}", outcome.rows_skipped.to_string().yellow());
    }
    println!("  Watermark:    {}", watermark(outcome.watermark.as_ref()));
    Ok(())
}

pub(crate) fn watermark(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
