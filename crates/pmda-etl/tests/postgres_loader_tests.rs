//! PostgreSQL loader tests
//!
//! These start a PostgreSQL container and need Docker:
//!
//! ```bash
//! cargo test -p pmda-etl --test postgres_loader_tests -- --ignored
//! ```

mod common;

use anyhow::Result;
use common::{approvals_config, approvals_csv, init_test_tracing, row, StaticFetcher, APPROVALS_URL};
use futures::stream::{self, StreamExt};
use pmda_etl::alert::AlertManager;
use pmda_etl::config::RunSettings;
use pmda_etl::loader::postgres::PostgresLoader;
use pmda_etl::loader::{LoaderAdapter, StagingArea};
use pmda_etl::orchestrator::Orchestrator;
use pmda_etl::schema::{ColumnDef, SqlType, TableSchema};
use pmda_etl::source::RunParams;
use pmda_etl::state::{RunMode, RunStatus};
use pmda_etl::CancellationToken;
use serde_json::json;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use uuid::Uuid;

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    init_test_tracing();

    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let conn_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&conn_string)
        .await?;
    info!(port, "PostgreSQL test container ready");

    Ok((container, pool))
}

async fn count(pool: &PgPool, table: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?)
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_init_db_is_idempotent() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let loader = PostgresLoader::from_pool(pool.clone());

    loader.ensure_state_schema().await?;
    loader.ensure_state_schema().await?;

    assert_eq!(count(&pool, "etl_runs").await?, 0);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_full_and_delta_runs_through_copy() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let loader = Arc::new(PostgresLoader::from_pool(pool.clone()));
    loader.ensure_state_schema().await?;

    let config = approvals_config("");
    let dataset = config.dataset("approvals")?;
    let fetcher = Arc::new(StaticFetcher::new());
    let orchestrator = Orchestrator::new(
        loader.clone(),
        fetcher.clone(),
        Arc::new(AlertManager::default()),
        RunSettings {
            batch_size: 2,
            ..RunSettings::default()
        },
    );
    let run = |mode| {
        orchestrator.run(&dataset, Some(mode), RunParams::default(), CancellationToken::new())
    };

    fetcher.set(
        APPROVALS_URL,
        approvals_csv(&[
            row("A1", "One", "2024-01-10"),
            row("A2", "Tab\tbed", "2024-01-11"),
            row("A2", "Two", "2024-01-11"),
            row("A3", "Three", "令和6年1月12日"),
        ]),
    );
    let full = run(RunMode::Full).await?;
    assert!(full.succeeded(), "{full:?}");
    assert_eq!(full.rows_loaded, 4);
    assert_eq!(count(&pool, "public.pmda_approvals").await?, 3);

    let brand: String =
        sqlx::query_scalar("SELECT brand_name_jp FROM public.pmda_approvals WHERE approval_id = 'A2'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(brand, "Two");

    fetcher.set(
        APPROVALS_URL,
        approvals_csv(&[row("A1", "One v2", "2024-02-01"), row("A4", "Four", "2024-02-02")]),
    );
    let delta = run(RunMode::Delta).await?;
    assert!(delta.succeeded(), "{delta:?}");
    assert_eq!(count(&pool, "public.pmda_approvals").await?, 4);
    assert_eq!(delta.watermark, Some(json!("2024-02-02")));

    let brand: String =
        sqlx::query_scalar("SELECT brand_name_jp FROM public.pmda_approvals WHERE approval_id = 'A1'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(brand, "One v2");

    let history = orchestrator.state().list_recent("approvals", 10).await?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == RunStatus::Success));
    assert_eq!(history[0].watermark, Some(json!("2024-02-02")));

    let leftovers: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_tables WHERE tablename LIKE '\\_pmda\\_stg\\_%'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_advisory_lock_excludes_second_holder() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let loader = PostgresLoader::from_pool(pool);

    let lease = loader.try_lock_dataset("approvals").await?.expect("first lock");
    assert!(loader.try_lock_dataset("approvals").await?.is_none());
    assert!(loader.try_lock_dataset("jader").await?.is_some());

    lease.release().await?;
    assert!(loader.try_lock_dataset("approvals").await?.is_some());
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_rejected_row_leaves_no_staging_table() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let loader = PostgresLoader::from_pool(pool.clone());

    let target = TableSchema {
        schema: "public".into(),
        table: "counts".into(),
        columns: vec![
            ColumnDef::new("id", SqlType::Text).not_null(),
            ColumnDef::new("n", SqlType::Integer),
        ],
        primary_key: vec!["id".into()],
    };
    loader.ensure_schema(&target).await?;

    let area = StagingArea::new(&target, Uuid::new_v4(), 100);
    let rows = stream::iter(vec![
        Ok(vec![json!("a"), json!(1)]),
        Ok(vec![json!("b"), json!("not a number")]),
    ])
    .boxed();

    let err = loader.stage_bulk(rows, &area).await.unwrap_err();
    assert_eq!(err.kind(), "data_integrity_error");

    let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
        .bind(format!("public.{}", area.name))
        .fetch_one(&pool)
        .await?;
    assert!(exists.is_none());
    assert_eq!(count(&pool, "public.counts").await?, 0);
    Ok(())
}
