//! Native PostgreSQL loader
//!
//! Staging streams rows through the `COPY FROM STDIN` protocol into an
//! unlogged table created in the same transaction, so a failed COPY leaves no
//! staging table behind. Apply runs as one transaction: full mode truncates
//! and reloads the target, delta mode upserts with `ON CONFLICT`. Readers see
//! either the old contents or the new ones.
//!
//! Dataset locks are session-level advisory locks held on a dedicated pooled
//! connection for the lifetime of the lease.

use super::copy::encode_row;
use super::{DatasetLease, LoaderAdapter, LockGuard, MergeSpec, RowStream, StagingArea, TieBreak};
use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use crate::schema::{quote_ident, TableSchema};
use crate::state::{FailureSummary, RunFinalization, RunRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgCopyIn, PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ordinal column appended to every staging table
const SEQ_COLUMN: &str = "_pmda_seq";

const RUN_COLUMNS: &str = "run_id, dataset, mode, status, started_at, finished_at, \
     rows_loaded, rows_skipped, watermark, params, failed_stage, error_kind, error_message, \
     pipeline_version";

pub struct PostgresLoader {
    pool: PgPool,
}

impl PostgresLoader {
    /// Open a connection pool for the configured database
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let password = config
            .password
            .as_deref()
            .ok_or_else(|| EtlError::config("database password is not set (PMDA_DB_PASSWORD)"))?;

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(password)
            .database(&config.dbname)
            .application_name("pmda-loader");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await?;

        info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            max_connections = config.max_connections,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn column_list(target: &TableSchema) -> String {
    target
        .column_names()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_list(keys: &[String]) -> String {
    keys.iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT ... SELECT` picking one row per key from the staging table
fn dedup_insert_sql(area: &StagingArea, target: &TableSchema, tie_break: TieBreak) -> String {
    let columns = column_list(target);
    let keys = key_list(&target.primary_key);
    let direction = match tie_break {
        TieBreak::Last => "DESC",
        TieBreak::First => "ASC",
    };
    format!(
        "INSERT INTO {target} ({columns}) \
         SELECT DISTINCT ON ({keys}) {columns} FROM {staging} \
         ORDER BY {keys}, {seq} {direction}",
        target = target.qualified_name(),
        staging = area.qualified_name(),
        seq = quote_ident(SEQ_COLUMN),
    )
}

fn upsert_clause(target: &TableSchema, merge: &MergeSpec) -> String {
    let updates: Vec<String> = target
        .column_names()
        .filter(|c| !merge.keys.iter().any(|k| k == c))
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", key_list(&merge.keys))
    } else {
        format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            key_list(&merge.keys),
            updates.join(", ")
        )
    }
}

/// Send every row through an open COPY, flushing every `batch_size` rows
async fn copy_rows(
    copy: &mut PgCopyIn<&mut PgConnection>,
    mut rows: RowStream<'_>,
    area: &StagingArea,
) -> Result<u64> {
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut count: u64 = 0;
    let mut pending = 0usize;

    while let Some(row) = rows.next().await {
        let row = row?;
        area.target.check_row(&row)?;
        encode_row(&row, &area.target.columns, count as i64, &mut buf);
        count += 1;
        pending += 1;

        if pending >= area.batch_size {
            copy.send(std::mem::take(&mut buf)).await?;
            debug!(staging = %area.name, rows = count, "Flushed COPY batch");
            pending = 0;
        }
    }

    if !buf.is_empty() {
        copy.send(buf).await?;
    }

    Ok(count)
}

#[async_trait]
impl LoaderAdapter for PostgresLoader {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_state_schema(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| EtlError::state(format!("run state migration failed: {}", e)))?;
        Ok(())
    }

    async fn ensure_schema(&self, table: &TableSchema) -> Result<()> {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable && !table.primary_key.contains(&c.name) {
                    ""
                } else {
                    " NOT NULL"
                };
                format!("{} {}{}", quote_ident(&c.name), c.sql_type.sql_name(), null)
            })
            .collect();

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&table.schema)
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            table.qualified_name(),
            columns.join(", "),
            key_list(&table.primary_key)
        ))
        .execute(&self.pool)
        .await?;

        debug!(table = %table.display_name(), "Target table ensured");
        Ok(())
    }

    async fn stage_bulk<'a>(&self, rows: RowStream<'a>, area: &StagingArea) -> Result<u64> {
        let mut definitions: Vec<String> = area
            .target
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.sql_name()))
            .collect();
        definitions.push(format!("{} BIGINT NOT NULL", quote_ident(SEQ_COLUMN)));

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE UNLOGGED TABLE {} ({})",
            area.qualified_name(),
            definitions.join(", ")
        ))
        .execute(&mut *tx)
        .await?;

        let copy_sql = format!(
            "COPY {} ({}, {}) FROM STDIN",
            area.qualified_name(),
            column_list(&area.target),
            quote_ident(SEQ_COLUMN)
        );
        let mut copy = tx.copy_in_raw(&copy_sql).await?;

        match copy_rows(&mut copy, rows, area).await {
            Ok(count) => {
                copy.finish().await.map_err(|e| {
                    EtlError::integrity(
                        area.target.display_name(),
                        format!("bulk ingest rejected: {}", e),
                    )
                })?;
                tx.commit().await?;
                info!(staging = %area.name, rows = count, "Rows staged via COPY");
                Ok(count)
            },
            Err(e) => {
                if let Err(abort_err) = copy.abort(e.to_string()).await {
                    debug!(error = %abort_err, "COPY abort acknowledged with error");
                }
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, staging = %area.name, "Staging rollback failed");
                }
                Err(e)
            },
        }
    }

    async fn apply_full(&self, area: &StagingArea, target: &TableSchema) -> Result<()> {
        let table = target.display_name();
        let apply_err = |e: sqlx::Error| EtlError::apply(table.clone(), e.to_string());

        let mut tx = self.pool.begin().await.map_err(apply_err)?;
        sqlx::query(&format!("TRUNCATE {}", target.qualified_name()))
            .execute(&mut *tx)
            .await
            .map_err(apply_err)?;
        let inserted = sqlx::query(&dedup_insert_sql(area, target, TieBreak::Last))
            .execute(&mut *tx)
            .await
            .map_err(apply_err)?
            .rows_affected();
        sqlx::query(&format!("DROP TABLE {}", area.qualified_name()))
            .execute(&mut *tx)
            .await
            .map_err(apply_err)?;
        tx.commit().await.map_err(apply_err)?;

        info!(table = %table, rows = inserted, "Full refresh applied");
        Ok(())
    }

    async fn apply_delta(
        &self,
        area: &StagingArea,
        target: &TableSchema,
        merge: &MergeSpec,
    ) -> Result<()> {
        let table = target.display_name();
        let apply_err = |e: sqlx::Error| EtlError::apply(table.clone(), e.to_string());
        let sql = format!(
            "{}{}",
            dedup_insert_sql(area, target, merge.tie_break),
            upsert_clause(target, merge)
        );

        let mut tx = self.pool.begin().await.map_err(apply_err)?;
        let merged = sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(apply_err)?
            .rows_affected();
        sqlx::query(&format!("DROP TABLE {}", area.qualified_name()))
            .execute(&mut *tx)
            .await
            .map_err(apply_err)?;
        tx.commit().await.map_err(apply_err)?;

        info!(table = %table, rows = merged, "Delta merged");
        Ok(())
    }

    async fn discard_staging(&self, area: &StagingArea) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", area.qualified_name()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock_dataset(&self, dataset: &str) -> Result<Option<DatasetLease>> {
        let key = lock_key(dataset);
        let mut conn = self.pool.acquire().await?;
        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(&key)
                .fetch_one(&mut *conn)
                .await?;

        if !locked {
            return Ok(None);
        }

        let guard = PgLockGuard {
            conn: Some(conn),
            key,
        };
        Ok(Some(DatasetLease::new(dataset, Box::new(guard))))
    }

    async fn write_run_record(&self, record: &RunRecord) -> Result<()> {
        let (stage, kind, message) = failure_columns(record.failure.as_ref());
        sqlx::query(&format!(
            "INSERT INTO etl_runs ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            RUN_COLUMNS
        ))
        .bind(record.run_id)
        .bind(&record.dataset)
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.rows_loaded)
        .bind(record.rows_skipped)
        .bind(&record.watermark)
        .bind(&record.params)
        .bind(stage)
        .bind(kind)
        .bind(message)
        .bind(&record.pipeline_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_run_record(&self, run_id: Uuid, fin: &RunFinalization) -> Result<bool> {
        let (stage, kind, message) = failure_columns(fin.failure.as_ref());
        let result = sqlx::query(
            r#"
            UPDATE etl_runs SET
                status = $2,
                finished_at = $3,
                rows_loaded = $4,
                rows_skipped = $5,
                watermark = $6,
                failed_stage = $7,
                error_kind = $8,
                error_message = $9
            WHERE run_id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(fin.status.as_str())
        .bind(fin.finished_at)
        .bind(fin.rows_loaded)
        .bind(fin.rows_skipped)
        .bind(&fin.watermark)
        .bind(stage)
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn last_success(&self, dataset: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs WHERE dataset = $1 AND status = 'success' \
             ORDER BY started_at DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn recent_runs(&self, dataset: &str, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs WHERE dataset = $1 ORDER BY started_at DESC LIMIT $2",
            RUN_COLUMNS
        ))
        .bind(dataset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn latest_runs(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT DISTINCT ON (dataset) {} FROM etl_runs ORDER BY dataset, started_at DESC",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn latest_failures(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT DISTINCT ON (dataset) {} FROM etl_runs WHERE status = 'failed' \
             ORDER BY dataset, started_at DESC",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn running_runs(&self, dataset: &str) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs WHERE dataset = $1 AND status = 'running' \
             ORDER BY started_at",
            RUN_COLUMNS
        ))
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }
}

fn lock_key(dataset: &str) -> String {
    format!("pmda-etl:{}", dataset)
}

fn failure_columns(
    failure: Option<&FailureSummary>,
) -> (Option<String>, Option<String>, Option<String>) {
    match failure {
        Some(f) => (
            Some(f.stage.clone()),
            Some(f.kind.clone()),
            Some(f.message.clone()),
        ),
        None => (None, None, None),
    }
}

/// Advisory lock held on a connection taken out of the pool
struct PgLockGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: String,
}

#[async_trait]
impl LockGuard for PgLockGuard {
    async fn release(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>(
            "SELECT pg_advisory_unlock(hashtextextended($1, 0))",
        )
        .bind(&self.key)
        .fetch_one(&mut *conn)
        .await;

        match unlocked {
            Ok(_) => Ok(()),
            Err(e) => {
                // closing the session is the only other way to free the lock
                drop(conn.detach());
                Err(e.into())
            },
        }
    }
}

impl Drop for PgLockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = %self.key, "Dataset lock dropped without release; closing its session");
            drop(conn.detach());
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    dataset: String,
    mode: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    rows_loaded: i64,
    rows_skipped: i64,
    watermark: Option<Value>,
    params: Value,
    failed_stage: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    pipeline_version: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = EtlError;

    fn try_from(row: RunRow) -> Result<Self> {
        let failure = match (row.failed_stage, row.error_kind, row.error_message) {
            (Some(stage), Some(kind), message) => Some(FailureSummary {
                stage,
                kind,
                message: message.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(RunRecord {
            run_id: row.run_id,
            dataset: row.dataset,
            mode: row.mode.parse()?,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            rows_loaded: row.rows_loaded,
            rows_skipped: row.rows_skipped,
            watermark: row.watermark,
            params: row.params,
            failure,
            pipeline_version: row.pipeline_version,
        })
    }
}
