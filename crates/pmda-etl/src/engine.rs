//! Engine wiring
//!
//! [`Engine`] turns an [`AppConfig`] into connected components and exposes
//! the operations the command line drives: schema initialization, a
//! read-only configuration check, dataset runs and run history.

use crate::alert::AlertManager;
use crate::config::AppConfig;
use crate::error::Result;
use crate::fetch::{CacheStore, HttpFetcher, OriginThrottle, ResourceFetcher};
use crate::loader::{self, LoaderAdapter};
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::source::RunParams;
use crate::state::{RunMode, RunRecord, RunStateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What `check-config` verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// `host:port/dbname` of the target database
    pub database: String,
    pub datasets: Vec<String>,
}

/// Latest run of every dataset plus the latest failure of each
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub latest: Vec<RunRecord>,
    pub failures: Vec<RunRecord>,
}

impl StatusReport {
    /// Latest failed record of `dataset`, if it ever failed
    pub fn failure_for(&self, dataset: &str) -> Option<&RunRecord> {
        self.failures.iter().find(|r| r.dataset == dataset)
    }
}

pub struct Engine {
    config: AppConfig,
    loader: Arc<dyn LoaderAdapter>,
    state: RunStateStore,
}

impl Engine {
    /// Connect to the configured target database
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let loader = loader::connect(&config.database).await?;
        Ok(Self::with_loader(config, loader))
    }

    pub fn with_loader(config: AppConfig, loader: Arc<dyn LoaderAdapter>) -> Self {
        Self {
            state: RunStateStore::new(Arc::clone(&loader)),
            config,
            loader,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> &RunStateStore {
        &self.state
    }

    /// Create the run state schema; a second call changes nothing
    pub async fn init_db(&self) -> Result<()> {
        self.state.init_schema().await?;
        info!(
            host = %self.config.database.host,
            dbname = %self.config.database.dbname,
            "Run state schema is ready"
        );
        Ok(())
    }

    /// Resolve every dataset and reach the database without writing anything
    pub async fn check(&self) -> Result<CheckReport> {
        let datasets = self.config.dataset_names();
        for name in &datasets {
            let descriptor = self.config.dataset(name)?;
            debug!(
                dataset = %name,
                target = %descriptor.target.display_name(),
                source = %descriptor.source.as_str(),
                "Dataset configuration resolved"
            );
        }

        self.loader.ping().await?;

        let db = &self.config.database;
        Ok(CheckReport {
            database: format!("{}:{}/{}", db.host, db.port, db.dbname),
            datasets,
        })
    }

    /// Build the cached, throttled HTTP fetcher shared by every dataset
    pub async fn http_fetcher(&self) -> Result<HttpFetcher> {
        let fetch = &self.config.fetch;

        let mut throttle = OriginThrottle::new(fetch.rate_limit());
        for name in self.config.dataset_names() {
            let descriptor = self.config.dataset(&name)?;
            throttle.register(&descriptor.source.origin(), descriptor.rate_limit);
        }

        let cache = CacheStore::open(&fetch.cache_dir).await?;
        debug!(cache_dir = %fetch.cache_dir.display(), "Opened fetch cache");
        if let Some(max_age) = fetch.cache_max_age() {
            let removed = cache.purge_older_than(max_age).await?;
            if removed > 0 {
                info!(removed, "Evicted stale cache entries");
            }
        }

        HttpFetcher::new(fetch, Some(cache), Arc::new(throttle))
    }

    /// Run one dataset over HTTP
    pub async fn run_dataset(
        &self,
        dataset: &str,
        mode: Option<RunMode>,
        params: RunParams,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let fetcher = Arc::new(self.http_fetcher().await?);
        self.run_with_fetcher(dataset, mode, params, fetcher, cancel)
            .await
    }

    /// Run one dataset with the given fetcher
    pub async fn run_with_fetcher(
        &self,
        dataset: &str,
        mode: Option<RunMode>,
        params: RunParams,
        fetcher: Arc<dyn ResourceFetcher>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let descriptor = self.config.dataset(dataset)?;
        let alerts = Arc::new(AlertManager::from_config(&self.config.alerting)?);
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.loader),
            fetcher,
            alerts,
            self.config.run.clone(),
        );

        orchestrator.run(&descriptor, mode, params, cancel).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            latest: self.state.latest_per_dataset().await?,
            failures: self.state.latest_failures().await?,
        })
    }

    /// Most recent runs of one dataset, newest first
    pub async fn history(&self, dataset: &str, limit: i64) -> Result<Vec<RunRecord>> {
        self.state.list_recent(dataset, limit).await
    }
}
