//! Run State Store
//!
//! Append-only history of pipeline runs. A record is written with status
//! `running` before a run touches anything, and [`RunStateStore::finalize`]
//! is the one and only mutation that moves it to `success` or `failed`.
//! The latest `success` record of a dataset is the resume point for its next
//! delta run.

use crate::error::{EtlError, Result};
use crate::loader::LoaderAdapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// Version string stamped on every run record
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Full,
    Delta,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Delta => "delta",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunMode {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(RunMode::Full),
            "delta" => Ok(RunMode::Delta),
            other => Err(EtlError::config(format!("unknown run mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(EtlError::state(format!("unknown run status '{}'", other))),
        }
    }
}

/// What an operator needs to decide between a full or delta retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub stage: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub dataset: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_loaded: i64,
    pub rows_skipped: i64,
    pub watermark: Option<Value>,
    /// Invocation parameters (year, drug names, refresh flag)
    pub params: Value,
    pub failure: Option<FailureSummary>,
    pub pipeline_version: String,
}

impl RunRecord {
    pub fn running(dataset: &str, mode: RunMode, params: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dataset: dataset.to_string(),
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            rows_loaded: 0,
            rows_skipped: 0,
            watermark: None,
            params,
            failure: None,
            pipeline_version: PIPELINE_VERSION.to_string(),
        }
    }

    /// Copy of this record with a finalization applied
    pub fn finalized(&self, fin: &RunFinalization) -> Self {
        Self {
            status: fin.status,
            finished_at: Some(fin.finished_at),
            rows_loaded: fin.rows_loaded,
            rows_skipped: fin.rows_skipped,
            watermark: fin.watermark.clone(),
            failure: fin.failure.clone(),
            ..self.clone()
        }
    }
}

/// Terminal state written by [`RunStateStore::finalize`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub rows_loaded: i64,
    pub rows_skipped: i64,
    pub watermark: Option<Value>,
    pub failure: Option<FailureSummary>,
}

impl RunFinalization {
    pub fn success(rows_loaded: i64, rows_skipped: i64, watermark: Option<Value>) -> Self {
        Self {
            status: RunStatus::Success,
            finished_at: Utc::now(),
            rows_loaded,
            rows_skipped,
            watermark,
            failure: None,
        }
    }

    pub fn failed(failure: FailureSummary, rows_skipped: i64) -> Self {
        Self {
            status: RunStatus::Failed,
            finished_at: Utc::now(),
            rows_loaded: 0,
            rows_skipped,
            watermark: None,
            failure: Some(failure),
        }
    }
}

/// Order two watermark values of the same kind
///
/// Numbers compare numerically and strings lexically (ISO dates and RFC 3339
/// UTC timestamps sort correctly that way). Mixed kinds are incomparable.
pub fn compare_watermarks(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Facade over the run-state half of a [`LoaderAdapter`]
#[derive(Clone)]
pub struct RunStateStore {
    backend: Arc<dyn LoaderAdapter>,
}

impl RunStateStore {
    pub fn new(backend: Arc<dyn LoaderAdapter>) -> Self {
        Self { backend }
    }

    /// Create the run state tables; safe to repeat
    pub async fn init_schema(&self) -> Result<()> {
        self.backend.ensure_state_schema().await
    }

    pub async fn get_last_success(&self, dataset: &str) -> Result<Option<RunRecord>> {
        self.backend.last_success(dataset).await
    }

    pub async fn create_running(
        &self,
        dataset: &str,
        mode: RunMode,
        params: Value,
    ) -> Result<RunRecord> {
        let record = RunRecord::running(dataset, mode, params);
        self.backend.write_run_record(&record).await?;
        Ok(record)
    }

    /// Move a running record to its terminal status
    ///
    /// Fails when the record does not exist or was already finalized.
    pub async fn finalize(&self, run_id: Uuid, fin: RunFinalization) -> Result<()> {
        if fin.status == RunStatus::Running {
            return Err(EtlError::state(format!(
                "run {} cannot be finalized as running",
                run_id
            )));
        }

        if !self.backend.finalize_run_record(run_id, &fin).await? {
            return Err(EtlError::state(format!(
                "run {} is not running and cannot be finalized again",
                run_id
            )));
        }

        Ok(())
    }

    pub async fn list_recent(&self, dataset: &str, limit: i64) -> Result<Vec<RunRecord>> {
        self.backend.recent_runs(dataset, limit.max(1)).await
    }

    /// Latest record of every dataset that has ever run
    pub async fn latest_per_dataset(&self) -> Result<Vec<RunRecord>> {
        self.backend.latest_runs().await
    }

    /// Latest failed record of every dataset with a failure in its history
    pub async fn latest_failures(&self) -> Result<Vec<RunRecord>> {
        self.backend.latest_failures().await
    }

    /// Records of a dataset still marked running
    pub async fn running(&self, dataset: &str) -> Result<Vec<RunRecord>> {
        self.backend.running_runs(dataset).await
    }
}
