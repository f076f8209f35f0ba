//! Shared helpers for the pmda-etl integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pmda_common::checksum::sha256_hex;
use pmda_etl::config::AppConfig;
use pmda_etl::fetch::{FetchRequest, FetchedResource, ResourceFetcher};
use pmda_etl::{EtlError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const APPROVALS_URL: &str = "https://www.pmda.go.jp/files/approvals.csv";
pub const APPROVALS_TABLE: &str = "public.pmda_approvals";

/// Serves fixed payloads keyed by URL; unknown URLs answer 404
#[derive(Default)]
pub struct StaticFetcher {
    resources: Mutex<HashMap<String, Bytes>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.set(url, body);
        self
    }

    pub fn set(&self, url: &str, body: impl Into<Bytes>) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.resources.lock().unwrap().remove(url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payload = self
            .resources
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| EtlError::fetch(&request.url, "HTTP 404 Not Found", false))?;

        Ok(FetchedResource {
            url: request.url.clone(),
            content_hash: sha256_hex(&payload),
            validator: None,
            payload,
            from_cache: false,
        })
    }
}

/// Never answers; only cancellation ends a fetch through it
pub struct HangingFetcher;

#[async_trait]
impl ResourceFetcher for HangingFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchedResource> {
        futures::future::pending().await
    }
}

/// Configuration with the database password supplied
pub fn config(yaml: &str) -> AppConfig {
    AppConfig::from_yaml_with_env(yaml, |key| {
        (key == "PMDA_DB_PASSWORD").then(|| "test".to_string())
    })
    .unwrap()
}

/// Single-dataset configuration for the approvals list, plus extra keys
pub fn approvals_config(extra: &str) -> AppConfig {
    config(&format!(
        r#"
datasets:
  approvals:
    extractor:
      url: "{APPROVALS_URL}"
    parser: csv
    transformer: approvals
    target:
      table: pmda_approvals
    merge_keys: [approval_id]
    watermark_column: approval_date
{extra}
"#
    ))
}

/// Approvals CSV with `(id, brand, date)` rows
pub fn approvals_csv(rows: &[(String, String, String)]) -> String {
    let mut csv = String::from("承認番号,販売名,承認日\n");
    for (id, brand, date) in rows {
        csv.push_str(&format!("{id},{brand},{date}\n"));
    }
    csv
}

pub fn row(id: &str, brand: &str, date: &str) -> (String, String, String) {
    (id.to_string(), brand.to_string(), date.to_string())
}

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pmda_etl=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}
