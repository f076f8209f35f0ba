//! In-memory reference loader
//!
//! Inserts staged rows one at a time and applies them under a single mutex,
//! which makes every apply trivially atomic. Slow and volatile; used as the
//! fallback implementation of the adapter contract and as a test double.

use super::{DatasetLease, LoaderAdapter, LockGuard, MergeSpec, RowStream, StagingArea, TieBreak};
use crate::error::{EtlError, Result};
use crate::schema::{Row, TableSchema};
use crate::state::{RunFinalization, RunRecord, RunStatus};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Row>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    staging: HashMap<String, Vec<Row>>,
    runs: Vec<RunRecord>,
    state_schema_ready: bool,
}

#[derive(Default)]
pub struct MemoryLoader {
    state: Mutex<MemoryState>,
    locks: Arc<Mutex<HashSet<String>>>,
    fail_apply: AtomicBool,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following apply fail, to exercise rollback paths
    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Current rows of a target table, keyed by `schema.table`
    pub fn table_rows(&self, display_name: &str) -> Vec<Row> {
        lock(&self.state)
            .tables
            .get(display_name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of staging areas currently held
    pub fn staging_areas(&self) -> usize {
        lock(&self.state).staging.len()
    }

    pub fn is_locked(&self, dataset: &str) -> bool {
        lock(&self.locks).contains(dataset)
    }

    fn check_apply(&self, target: &TableSchema) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(EtlError::apply(target.display_name(), "injected apply failure"));
        }
        Ok(())
    }
}

/// Collapse rows sharing a key, keeping the first-seen position
fn dedupe(rows: Vec<Row>, schema: &TableSchema, tie_break: TieBreak) -> Result<Vec<Row>> {
    let keys = schema.key_indices()?;
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Row> = Vec::with_capacity(rows.len());

    for row in rows {
        let key = schema.key_of(&row, &keys);
        match positions.get(&key) {
            Some(&pos) if tie_break == TieBreak::Last => out[pos] = row,
            Some(_) => {},
            None => {
                positions.insert(key, out.len());
                out.push(row);
            },
        }
    }

    Ok(out)
}

#[async_trait]
impl LoaderAdapter for MemoryLoader {
    fn engine(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_state_schema(&self) -> Result<()> {
        lock(&self.state).state_schema_ready = true;
        Ok(())
    }

    async fn ensure_schema(&self, table: &TableSchema) -> Result<()> {
        lock(&self.state)
            .tables
            .entry(table.display_name())
            .or_insert_with(|| MemoryTable {
                schema: table.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn stage_bulk<'a>(&self, mut rows: RowStream<'a>, area: &StagingArea) -> Result<u64> {
        let mut staged = Vec::new();
        while let Some(row) = rows.next().await {
            let row = row?;
            area.target.check_row(&row)?;
            staged.push(row);
        }

        let count = staged.len() as u64;
        lock(&self.state).staging.insert(area.name.clone(), staged);
        Ok(count)
    }

    async fn apply_full(&self, area: &StagingArea, target: &TableSchema) -> Result<()> {
        self.check_apply(target)?;
        let mut state = lock(&self.state);
        if !state.tables.contains_key(&target.display_name()) {
            return Err(EtlError::apply(target.display_name(), "target table does not exist"));
        }
        let staged = state.staging.remove(&area.name).ok_or_else(|| {
            EtlError::apply(target.display_name(), format!("staging area {} not found", area.name))
        })?;

        let rows = dedupe(staged, target, TieBreak::Last)?;
        if let Some(table) = state.tables.get_mut(&target.display_name()) {
            table.rows = rows;
        }
        Ok(())
    }

    async fn apply_delta(
        &self,
        area: &StagingArea,
        target: &TableSchema,
        merge: &MergeSpec,
    ) -> Result<()> {
        self.check_apply(target)?;
        let mut state = lock(&self.state);
        let staged = state.staging.remove(&area.name).ok_or_else(|| {
            EtlError::apply(target.display_name(), format!("staging area {} not found", area.name))
        })?;
        if staged.is_empty() {
            return Ok(());
        }

        let table = state
            .tables
            .get_mut(&target.display_name())
            .ok_or_else(|| EtlError::apply(target.display_name(), "target table does not exist"))?;

        let keys = table.schema.key_indices()?;
        let mut merged = table.rows.clone();
        let mut positions: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, row)| (table.schema.key_of(row, &keys), i))
            .collect();

        for row in dedupe(staged, target, merge.tie_break)? {
            let key = table.schema.key_of(&row, &keys);
            match positions.get(&key) {
                Some(&pos) => merged[pos] = row,
                None => {
                    positions.insert(key, merged.len());
                    merged.push(row);
                },
            }
        }

        table.rows = merged;
        Ok(())
    }

    async fn discard_staging(&self, area: &StagingArea) -> Result<()> {
        lock(&self.state).staging.remove(&area.name);
        Ok(())
    }

    async fn try_lock_dataset(&self, dataset: &str) -> Result<Option<DatasetLease>> {
        if !lock(&self.locks).insert(dataset.to_string()) {
            return Ok(None);
        }
        let guard = MemoryLockGuard {
            locks: Arc::clone(&self.locks),
            dataset: dataset.to_string(),
            held: true,
        };
        Ok(Some(DatasetLease::new(dataset, Box::new(guard))))
    }

    async fn write_run_record(&self, record: &RunRecord) -> Result<()> {
        let mut state = lock(&self.state);
        if state.runs.iter().any(|r| r.run_id == record.run_id) {
            return Err(EtlError::state(format!("run {} already recorded", record.run_id)));
        }
        state.runs.push(record.clone());
        Ok(())
    }

    async fn finalize_run_record(&self, run_id: Uuid, fin: &RunFinalization) -> Result<bool> {
        let mut state = lock(&self.state);
        match state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id && r.status == RunStatus::Running)
        {
            Some(record) => {
                *record = record.finalized(fin);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn last_success(&self, dataset: &str) -> Result<Option<RunRecord>> {
        Ok(lock(&self.state)
            .runs
            .iter()
            .rev()
            .find(|r| r.dataset == dataset && r.status == RunStatus::Success)
            .cloned())
    }

    async fn recent_runs(&self, dataset: &str, limit: i64) -> Result<Vec<RunRecord>> {
        Ok(lock(&self.state)
            .runs
            .iter()
            .rev()
            .filter(|r| r.dataset == dataset)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn latest_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(latest_by_dataset(&lock(&self.state).runs, |_| true))
    }

    async fn latest_failures(&self) -> Result<Vec<RunRecord>> {
        Ok(latest_by_dataset(&lock(&self.state).runs, |r| {
            r.status == RunStatus::Failed
        }))
    }

    async fn running_runs(&self, dataset: &str) -> Result<Vec<RunRecord>> {
        Ok(lock(&self.state)
            .runs
            .iter()
            .filter(|r| r.dataset == dataset && r.status == RunStatus::Running)
            .cloned()
            .collect())
    }
}

fn latest_by_dataset(runs: &[RunRecord], keep: impl Fn(&RunRecord) -> bool) -> Vec<RunRecord> {
    let mut seen = HashSet::new();
    let mut latest: Vec<RunRecord> = runs
        .iter()
        .rev()
        .filter(|r| keep(r) && seen.insert(r.dataset.clone()))
        .cloned()
        .collect();
    latest.sort_by(|a, b| a.dataset.cmp(&b.dataset));
    latest
}

struct MemoryLockGuard {
    locks: Arc<Mutex<HashSet<String>>>,
    dataset: String,
    held: bool,
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn release(&mut self) -> Result<()> {
        if self.held {
            lock(&self.locks).remove(&self.dataset);
            self.held = false;
        }
        Ok(())
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        if self.held {
            lock(&self.locks).remove(&self.dataset);
        }
    }
}
