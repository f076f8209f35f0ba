//! `pmda check-config` command implementation
//!
//! Loading the configuration already validated its shape; this resolves
//! every dataset and pings the database without writing anything.

use crate::error::Result;
use colored::Colorize;
use pmda_etl::config::AppConfig;
use pmda_etl::engine::Engine;

pub async fn run(config: AppConfig) -> Result<()> {
    let engine = Engine::connect(config).await?;
    let report = engine.check().await?;

    println!("{} Configuration is valid", "✓".green());
    println!("  Database: {}", report.database);
    if report.datasets.is_empty() {
        println!("  Datasets: {}", "none configured".yellow());
    } else {
        println!("  Datasets: {}", report.datasets.join(", "));
    }
    Ok(())
}
