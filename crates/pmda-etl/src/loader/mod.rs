//! Loader adapters
//!
//! A loader adapter is the capability set the orchestrator needs from a
//! target database: check connectivity, create tables, land rows in a
//! staging area, atomically apply staged rows, hold a per-dataset lock and
//! persist run records. Engines are added by implementing [`LoaderAdapter`];
//! [`connect`] picks the implementation for the configured database type.
//!
//! - [`postgres::PostgresLoader`]: `COPY FROM STDIN` into an unlogged staging
//!   table, then a single-transaction swap or merge
//! - [`memory::MemoryLoader`]: row-by-row reference implementation used as a
//!   test double

pub mod copy;
pub mod memory;
pub mod postgres;

use crate::config::{DatabaseConfig, DatabaseKind};
use crate::error::Result;
use crate::schema::{quote_ident, Row, TableSchema};
use crate::state::{RunFinalization, RunRecord};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Lazy, finite, non-restartable sequence of transformed rows
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

/// Which row wins when a batch carries the same merge key twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Last row in source order wins
    #[default]
    Last,
    /// First row in source order wins
    First,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub keys: Vec<String>,
    pub tie_break: TieBreak,
}

/// Transient landing table for one run of one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    pub run_id: Uuid,
    /// Unqualified staging table name, created in the target's schema
    pub name: String,
    pub target: TableSchema,
    /// Rows buffered per bulk-ingest flush
    pub batch_size: usize,
}

impl StagingArea {
    pub fn new(target: &TableSchema, run_id: Uuid, batch_size: usize) -> Self {
        Self {
            run_id,
            name: format!("_pmda_stg_{}", run_id.simple()),
            target: target.clone(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.target.schema), quote_ident(&self.name))
    }
}

/// Releases a dataset lock
#[async_trait]
pub trait LockGuard: Send {
    async fn release(&mut self) -> Result<()>;
}

/// Exclusive right to run one dataset
///
/// Dropping an unreleased lease still frees the lock, but without an
/// awaited confirmation; prefer [`DatasetLease::release`].
pub struct DatasetLease {
    dataset: String,
    guard: Box<dyn LockGuard>,
}

impl DatasetLease {
    pub fn new(dataset: impl Into<String>, guard: Box<dyn LockGuard>) -> Self {
        Self {
            dataset: dataset.into(),
            guard,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub async fn release(mut self) -> Result<()> {
        self.guard.release().await
    }
}

#[async_trait]
pub trait LoaderAdapter: Send + Sync {
    /// Engine name for logs ("postgres", "memory")
    fn engine(&self) -> &'static str;

    /// Verify the target is reachable
    async fn ping(&self) -> Result<()>;

    /// Create the run state tables if missing
    async fn ensure_state_schema(&self) -> Result<()>;

    /// Create the target table if missing, with its merge keys as primary key
    async fn ensure_schema(&self, table: &TableSchema) -> Result<()>;

    /// Land every row of `rows` in `area`, in order, and return the count
    ///
    /// Rows are checked against `area.target`; any failure (a bad row or an
    /// error yielded by the stream) leaves no staging area behind.
    async fn stage_bulk<'a>(&self, rows: RowStream<'a>, area: &StagingArea) -> Result<u64>;

    /// Atomically replace the target's contents with the staged rows
    async fn apply_full(&self, area: &StagingArea, target: &TableSchema) -> Result<()>;

    /// Atomically upsert the staged rows into the target by merge key
    async fn apply_delta(
        &self,
        area: &StagingArea,
        target: &TableSchema,
        merge: &MergeSpec,
    ) -> Result<()>;

    /// Drop a staging area; a no-op when it does not exist
    async fn discard_staging(&self, area: &StagingArea) -> Result<()>;

    /// Take the dataset lock without waiting; `None` when another run holds it
    async fn try_lock_dataset(&self, dataset: &str) -> Result<Option<DatasetLease>>;

    /// Insert a new run record
    async fn write_run_record(&self, record: &RunRecord) -> Result<()>;

    /// Finalize a running record; `false` when no running record matched
    async fn finalize_run_record(&self, run_id: Uuid, fin: &RunFinalization) -> Result<bool>;

    async fn last_success(&self, dataset: &str) -> Result<Option<RunRecord>>;

    /// Newest first
    async fn recent_runs(&self, dataset: &str, limit: i64) -> Result<Vec<RunRecord>>;

    async fn latest_runs(&self) -> Result<Vec<RunRecord>>;

    async fn latest_failures(&self) -> Result<Vec<RunRecord>>;

    async fn running_runs(&self, dataset: &str) -> Result<Vec<RunRecord>>;
}

/// Connect to the configured target database
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn LoaderAdapter>> {
    match config.kind {
        DatabaseKind::Postgres => Ok(Arc::new(postgres::PostgresLoader::connect(config).await?)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, SqlType};

    #[test]
    fn test_staging_area_naming() {
        let target = TableSchema {
            schema: "pmda".into(),
            table: "pmda_approvals".into(),
            columns: vec![ColumnDef::new("approval_id", SqlType::Text)],
            primary_key: vec!["approval_id".into()],
        };
        let run_id = Uuid::new_v4();
        let area = StagingArea::new(&target, run_id, 0);

        assert_eq!(area.name, format!("_pmda_stg_{}", run_id.simple()));
        assert!(area.name.len() <= 63);
        assert_eq!(area.batch_size, 1);
        assert!(area.qualified_name().starts_with("\"pmda\"."));
    }
}
