//! Pipeline orchestrator
//!
//! Drives one dataset end to end:
//!
//! ```text
//! Initializing → Fetching → Parsing → Transforming → Staging → Applying → Finalizing
//! ```
//!
//! Fetch, parse and transform form one lazy stream that the loader consumes
//! while staging, so a dataset is never held in memory as a whole. The run
//! record is created before any I/O and finalized exactly once, strictly
//! after the apply step has committed (or failed and rolled back).

pub mod stage;

pub use stage::{RunOutcome, Stage};

use crate::alert::{Alert, AlertManager};
use crate::config::{RecordErrorPolicy, RunSettings};
use crate::dataset::DatasetDescriptor;
use crate::error::{EtlError, Result};
use crate::fetch::{FetchRequest, ResourceFetcher};
use crate::loader::{LoaderAdapter, StagingArea};
use crate::parse::{RecordParser, RecordStream};
use crate::schema::{RawRecord, Row};
use crate::source::RunParams;
use crate::state::{
    compare_watermarks, FailureSummary, RunFinalization, RunMode, RunRecord, RunStateStore,
    RunStatus,
};
use crate::transform::RecordContext;
use crate::validate::RowValidator;
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use stage::StageTracker;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure kind recorded for runs found still `running` by a later run
pub const INTERRUPTED_KIND: &str = "interrupted";

/// A fetched and opened resource, ready to stream records from
struct OpenResource {
    context: Arc<RecordContext>,
    records: RecordStream,
}

type PositionedRecord = (Arc<RecordContext>, u64, RawRecord);

/// Where a delta run starts from
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    mode: RunMode,
    urls: Vec<String>,
    /// Rows at or below this watermark are skipped in delta mode
    baseline: Option<Value>,
    /// Watermark of the last successful run
    previous_watermark: Option<Value>,
}

/// Per-run counters and the record error policy
struct Progress<'a> {
    dataset: &'a DatasetDescriptor,
    policy: RecordErrorPolicy,
    validator: RowValidator<'a>,
    watermark_index: Option<usize>,
    baseline: Option<Value>,
    cancel: &'a CancellationToken,
    tracker: &'a StageTracker,
    skipped: u64,
    filtered: u64,
    max_watermark: Option<Value>,
}

impl Progress<'_> {
    /// Turn one positioned record into a row to stage, or drop it
    fn accept(&mut self, item: Result<PositionedRecord>) -> Option<Result<Row>> {
        if self.cancel.is_cancelled() {
            return Some(Err(EtlError::Cancelled(format!(
                "cancelled during {}",
                self.tracker.current()
            ))));
        }

        match self.process(item) {
            Ok(row) => row.map(Ok),
            Err(e) if e.is_record_level() && self.policy == RecordErrorPolicy::Skip => {
                self.skipped += 1;
                warn!(
                    dataset = %self.dataset.name,
                    kind = e.kind(),
                    error = %e,
                    "Skipping record"
                );
                None
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn process(&mut self, item: Result<PositionedRecord>) -> Result<Option<Row>> {
        let (context, position, record) = item?;
        self.tracker.enter(Stage::Transforming);

        let row = self
            .dataset
            .transformer
            .transform(&record, position, &context)?;

        let watermark = self
            .watermark_index
            .and_then(|i| row.get(i))
            .filter(|v| !v.is_null())
            .cloned();

        if let (Some(baseline), Some(value)) = (&self.baseline, &watermark) {
            match compare_watermarks(value, baseline) {
                Some(Ordering::Greater) => {}
                Some(_) => {
                    self.filtered += 1;
                    return Ok(None);
                }
                None => {
                    return Err(EtlError::transform(
                        position,
                        format!("watermark {value} cannot be compared with baseline {baseline}"),
                    ))
                }
            }
        }

        self.validator.check(&row, position)?;

        if let Some(value) = watermark {
            let newer = match &self.max_watermark {
                None => true,
                Some(current) => compare_watermarks(&value, current) == Some(Ordering::Greater),
            };
            if newer {
                self.max_watermark = Some(value);
            }
        }

        self.tracker.enter(Stage::Staging);
        Ok(Some(row))
    }
}

struct Loaded {
    rows: u64,
    skipped: u64,
    watermark: Option<Value>,
}

struct Failed {
    stage: Stage,
    error: EtlError,
    skipped: u64,
}

pub struct Orchestrator {
    loader: Arc<dyn LoaderAdapter>,
    state: RunStateStore,
    fetcher: Arc<dyn ResourceFetcher>,
    alerts: Arc<AlertManager>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        loader: Arc<dyn LoaderAdapter>,
        fetcher: Arc<dyn ResourceFetcher>,
        alerts: Arc<AlertManager>,
        settings: RunSettings,
    ) -> Self {
        Self {
            state: RunStateStore::new(Arc::clone(&loader)),
            loader,
            fetcher,
            alerts,
            settings,
        }
    }

    pub fn state(&self) -> &RunStateStore {
        &self.state
    }

    /// Run `dataset` once
    ///
    /// Errors raised before the run record exists (configuration problems,
    /// lock contention, an unreachable state store) are returned as `Err`.
    /// Once the record exists every failure is recorded and reported as an
    /// outcome with [`RunStatus::Failed`].
    pub async fn run(
        &self,
        dataset: &DatasetDescriptor,
        mode: Option<RunMode>,
        params: RunParams,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let mode = mode.unwrap_or(dataset.default_mode);
        let cancel = cancel.child_token();

        let lease = self
            .loader
            .try_lock_dataset(&dataset.name)
            .await?
            .ok_or_else(|| EtlError::LockContention(dataset.name.clone()))?;
        debug!(dataset = %dataset.name, "Acquired dataset lock");

        let work = self.run_locked(dataset, mode, &params, &cancel);
        tokio::pin!(work);

        let result = match self.settings.timeout() {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, &mut work).await;
                match timed {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            dataset = %dataset.name,
                            timeout_secs = limit.as_secs(),
                            "Run exceeded its time limit, cancelling"
                        );
                        cancel.cancel();
                        work.await
                    }
                }
            }
            None => work.await,
        };

        if let Err(e) = lease.release().await {
            warn!(dataset = %dataset.name, error = %e, "Failed to release dataset lock");
        }

        result
    }

    async fn run_locked(
        &self,
        dataset: &DatasetDescriptor,
        mode: RunMode,
        params: &RunParams,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.recover_interrupted(dataset).await?;

        let plan = self.plan(dataset, mode, params).await?;
        let record = self
            .state
            .create_running(&dataset.name, mode, params.to_json())
            .await?;

        info!(
            dataset = %dataset.name,
            run_id = %record.run_id,
            mode = %mode,
            resources = plan.urls.len(),
            baseline = ?plan.baseline,
            "Run started"
        );

        let tracker = StageTracker::new();
        let area = StagingArea::new(&dataset.target, record.run_id, self.settings.batch_size);
        let started = Utc::now();

        match self
            .execute(dataset, &plan, params, &area, &tracker, cancel, started)
            .await
        {
            Ok(loaded) => self.succeed(dataset, &record, &plan, loaded).await,
            Err(failed) => self.fail(dataset, &record, &area, failed).await,
        }
    }

    /// Close out records a crashed process left in `running`
    async fn recover_interrupted(&self, dataset: &DatasetDescriptor) -> Result<()> {
        for orphan in self.state.running(&dataset.name).await? {
            warn!(
                dataset = %dataset.name,
                run_id = %orphan.run_id,
                started_at = %orphan.started_at,
                "Found interrupted run, marking it failed"
            );
            let summary = FailureSummary {
                stage: "unknown".to_string(),
                kind: INTERRUPTED_KIND.to_string(),
                message: "run ended without being finalized".to_string(),
            };
            self.state
                .finalize(orphan.run_id, RunFinalization::failed(summary, orphan.rows_skipped))
                .await?;

            // a crash between staging and apply leaves the staging area behind
            let area = StagingArea::new(&dataset.target, orphan.run_id, self.settings.batch_size);
            self.loader.discard_staging(&area).await?;
        }
        Ok(())
    }

    /// Resolve the baseline and resource list; nothing is written yet
    async fn plan(
        &self,
        dataset: &DatasetDescriptor,
        mode: RunMode,
        params: &RunParams,
    ) -> Result<Plan> {
        let last_success = self.state.get_last_success(&dataset.name).await?;
        let previous_watermark = last_success.as_ref().and_then(|r| r.watermark.clone());

        let baseline = match mode {
            RunMode::Full => None,
            RunMode::Delta => match (&last_success, &previous_watermark) {
                (_, Some(watermark)) => Some(watermark.clone()),
                (Some(_), None) => dataset.default_epoch.clone(),
                (None, None) => match &dataset.default_epoch {
                    Some(epoch) => {
                        info!(
                            dataset = %dataset.name,
                            epoch = %epoch,
                            "No successful run yet, starting delta from the default epoch"
                        );
                        Some(epoch.clone())
                    }
                    None => {
                        return Err(EtlError::config(format!(
                            "dataset `{}` has no successful run to resume from and declares no \
                             default_epoch; run it in full mode first",
                            dataset.name
                        )))
                    }
                },
            },
        };

        // full runs ask `{since}` sources for everything after the epoch
        let since = match mode {
            RunMode::Full => dataset.default_epoch.as_ref(),
            RunMode::Delta => baseline.as_ref(),
        };
        let urls = dataset.source.expand(params, since)?;

        Ok(Plan {
            mode,
            urls,
            baseline,
            previous_watermark,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        dataset: &DatasetDescriptor,
        plan: &Plan,
        params: &RunParams,
        area: &StagingArea,
        tracker: &StageTracker,
        cancel: &CancellationToken,
        started: DateTime<Utc>,
    ) -> std::result::Result<Loaded, Failed> {
        let mut progress = Progress {
            dataset,
            policy: self.settings.on_record_error,
            validator: RowValidator::new(&dataset.validation),
            watermark_index: dataset.watermark_index(),
            baseline: plan.baseline.clone(),
            cancel,
            tracker,
            skipped: 0,
            filtered: 0,
            max_watermark: None,
        };

        let result = self
            .load(dataset, plan, params, area, &mut progress, started)
            .await;

        let skipped = progress.skipped;
        match result {
            Ok(rows) => {
                if progress.filtered > 0 {
                    debug!(
                        dataset = %dataset.name,
                        filtered = progress.filtered,
                        "Dropped rows at or below the delta baseline"
                    );
                }
                Ok(Loaded {
                    rows,
                    skipped,
                    watermark: progress.max_watermark,
                })
            }
            Err(error) => Err(Failed {
                stage: error.stage().unwrap_or_else(|| tracker.current()),
                error,
                skipped,
            }),
        }
    }

    async fn load(
        &self,
        dataset: &DatasetDescriptor,
        plan: &Plan,
        params: &RunParams,
        area: &StagingArea,
        progress: &mut Progress<'_>,
        started: DateTime<Utc>,
    ) -> Result<u64> {
        let tracker = progress.tracker;
        let cancel = progress.cancel;

        self.loader.ensure_schema(&dataset.target).await?;

        let parser = dataset.build_parser()?;
        let force_refresh =
            params.force_refresh || (plan.mode == RunMode::Full && dataset.refresh_on_full);

        let records = self.record_stream(
            dataset,
            plan.urls.clone(),
            parser.as_ref(),
            force_refresh,
            tracker,
            cancel,
            started,
        );
        let rows = records
            .filter_map(|item| future::ready(progress.accept(item)))
            .boxed();

        tracker.enter(Stage::Staging);
        let staged = self.loader.stage_bulk(rows, area).await?;
        info!(
            dataset = %dataset.name,
            run_id = %area.run_id,
            rows = staged,
            skipped = progress.skipped,
            "Staged rows"
        );

        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled("cancelled before apply".to_string()));
        }

        tracker.enter(Stage::Applying);
        match plan.mode {
            RunMode::Full => self.loader.apply_full(area, &dataset.target).await?,
            RunMode::Delta => {
                self.loader
                    .apply_delta(area, &dataset.target, &dataset.merge)
                    .await?
            }
        }
        tracker.enter(Stage::Finalizing);

        Ok(staged)
    }

    /// Fetch → parse as one lazy stream of positioned records
    #[allow(clippy::too_many_arguments)]
    fn record_stream<'s>(
        &'s self,
        dataset: &'s DatasetDescriptor,
        urls: Vec<String>,
        parser: &'s dyn RecordParser,
        force_refresh: bool,
        tracker: &'s StageTracker,
        cancel: &'s CancellationToken,
        started: DateTime<Utc>,
    ) -> BoxStream<'s, Result<PositionedRecord>> {
        stream::iter(urls)
            .then(move |url| async move {
                tracker.enter(Stage::Fetching);
                let request = FetchRequest {
                    url: url.clone(),
                    cache_ttl: dataset.cache_ttl,
                    force_refresh,
                };

                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(EtlError::Cancelled(format!("cancelled while fetching {url}")));
                    }
                    fetched = self.fetcher.fetch(&request) => fetched?,
                };
                debug!(
                    dataset = %dataset.name,
                    url = %url,
                    bytes = fetched.payload.len(),
                    from_cache = fetched.from_cache,
                    "Fetched resource"
                );

                tracker.enter(Stage::Parsing);
                let records = parser.parse(fetched.payload)?;
                Ok(OpenResource {
                    context: Arc::new(RecordContext {
                        source_url: fetched.url,
                        content_hash: fetched.content_hash,
                        extracted_at: Utc::now(),
                        loaded_at: started,
                    }),
                    records,
                })
            })
            .flat_map(|opened: Result<OpenResource>| match opened {
                Ok(resource) => {
                    let context = resource.context;
                    resource
                        .records
                        .zip(stream::iter(1u64..))
                        .map(move |(record, position)| {
                            record.map(|r| (Arc::clone(&context), position, r))
                        })
                        .boxed()
                }
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .boxed()
    }

    async fn succeed(
        &self,
        dataset: &DatasetDescriptor,
        record: &RunRecord,
        plan: &Plan,
        loaded: Loaded,
    ) -> Result<RunOutcome> {
        let watermark = loaded
            .watermark
            .clone()
            .or_else(|| plan.previous_watermark.clone());
        let fin = RunFinalization::success(
            to_i64(loaded.rows),
            to_i64(loaded.skipped),
            watermark.clone(),
        );
        self.state.finalize(record.run_id, fin).await?;

        info!(
            dataset = %dataset.name,
            run_id = %record.run_id,
            mode = %plan.mode,
            rows_loaded = loaded.rows,
            rows_skipped = loaded.skipped,
            watermark = ?watermark,
            "Run succeeded"
        );

        Ok(RunOutcome {
            run_id: record.run_id,
            dataset: dataset.name.clone(),
            mode: plan.mode,
            status: RunStatus::Success,
            rows_loaded: loaded.rows,
            rows_skipped: loaded.skipped,
            watermark,
            failure: None,
        })
    }

    async fn fail(
        &self,
        dataset: &DatasetDescriptor,
        record: &RunRecord,
        area: &StagingArea,
        failed: Failed,
    ) -> Result<RunOutcome> {
        if let Err(e) = self.loader.discard_staging(area).await {
            warn!(
                dataset = %dataset.name,
                run_id = %record.run_id,
                error = %e,
                "Failed to discard staging area"
            );
        }

        let summary = FailureSummary {
            stage: failed.stage.to_string(),
            kind: failed.error.kind().to_string(),
            message: failed.error.to_string(),
        };

        warn!(
            dataset = %dataset.name,
            run_id = %record.run_id,
            stage = %summary.stage,
            kind = %summary.kind,
            error = %failed.error,
            "Run failed"
        );

        let fin = RunFinalization::failed(summary.clone(), to_i64(failed.skipped));
        let finalized = self.state.finalize(record.run_id, fin).await;

        self.alerts
            .notify(&Alert {
                dataset: dataset.name.clone(),
                run_id: record.run_id,
                stage: summary.stage.clone(),
                kind: summary.kind.clone(),
                message: summary.message.clone(),
            })
            .await;

        finalized?;

        Ok(RunOutcome {
            run_id: record.run_id,
            dataset: dataset.name.clone(),
            mode: record.mode,
            status: RunStatus::Failed,
            rows_loaded: 0,
            rows_skipped: failed.skipped,
            watermark: None,
            failure: Some(summary),
        })
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
