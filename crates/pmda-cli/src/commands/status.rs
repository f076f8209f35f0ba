//! `pmda status` command implementation
//!
//! Without `--dataset`, shows the latest run of every dataset and the most
//! recent failure of each. With it, lists that dataset's recent history.

use super::run::watermark;
use crate::error::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use pmda_etl::config::AppConfig;
use pmda_etl::engine::Engine;
use pmda_etl::state::{RunRecord, RunStatus};

pub async fn run(config: AppConfig, dataset: Option<String>, limit: i64) -> Result<()> {
    let engine = Engine::connect(config).await?;

    match dataset {
        Some(name) => {
            let history = engine.history(&name, limit).await?;
            if history.is_empty() {
                println!("No runs recorded for '{}'.", name);
                return Ok(());
            }
            println!("{}", format!("Recent runs of {}:", name).cyan().bold());
            println!("{}", runs_table(&history));
            if let Some(failed) = history.iter().find(|r| r.status == RunStatus::Failed) {
                print_failure(failed);
            }
        }
        None => {
            let report = engine.status().await?;
            if report.latest.is_empty() {
                println!("No runs recorded yet.");
                println!("Run 'pmda run --dataset <name> --mode full' to load a dataset.");
                return Ok(());
            }
            println!("{}", "Latest runs:".cyan().bold());
            println!("{}", runs_table(&report.latest));

            if !report.failures.is_empty() {
                println!("{}", "Most recent failures:".cyan().bold());
                for failed in &report.failures {
                    print_failure(failed);
                }
            }
        }
    }

    Ok(())
}

fn runs_table(runs: &[RunRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            "Dataset", "Run", "Mode", "Status", "Started", "Finished", "Rows", "Skipped",
            "Watermark",
        ]);

    for run in runs {
        table.add_row(vec![
            run.dataset.clone(),
            run.run_id.to_string(),
            run.mode.to_string(),
            run.status.to_string(),
            timestamp(Some(run.started_at)),
            timestamp(run.finished_at),
            run.rows_loaded.to_string(),
            run.rows_skipped.to_string(),
            watermark(run.watermark.as_ref()),
        ]);
    }

    table
}

fn print_failure(run: &RunRecord) {
    let Some(failure) = &run.failure else {
        return;
    };
    println!(
        "{} {} run {} at {}",
        "✗".red(),
        run.dataset.bold(),
        run.run_id,
        timestamp(run.finished_at)
    );
    println!("  Stage:   {}", failure.stage);
    println!("  Kind:    {}", failure.kind.red());
    println!("  Message: {}", failure.message);
    println!();
}

fn timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pmda_etl::state::RunMode;
    use serde_json::json;

    #[test]
    fn test_runs_table_lists_each_record() {
        let mut record = RunRecord::running("approvals", RunMode::Delta, json!({}));
        record.watermark = Some(json!("2024-02-02"));

        let rendered = runs_table(&[record]).to_string();
        assert!(rendered.contains("approvals"));
        assert!(rendered.contains("delta"));
        assert!(rendered.contains("running"));
        assert!(rendered.contains("2024-02-02"));
    }

    #[test]
    fn test_unfinished_timestamp() {
        assert_eq!(timestamp(None), "-");
    }
}
