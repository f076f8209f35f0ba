//! `pmda init-db` command implementation

use crate::error::Result;
use colored::Colorize;
use pmda_etl::config::AppConfig;
use pmda_etl::engine::Engine;

/// Create the run state schema; safe to run against an initialized database
pub async fn run(config: AppConfig) -> Result<()> {
    let engine = Engine::connect(config).await?;
    engine.init_db().await?;

    let db = &engine.config().database;
    println!(
        "{} Run state schema ready in {}:{}/{}",
        "✓".green(),
        db.host,
        db.port,
        db.dbname
    );
    Ok(())
}
