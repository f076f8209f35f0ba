//! Cache & rate-limited fetcher
//!
//! [`HttpFetcher`] answers a [`FetchRequest`] from the [`CacheStore`] when
//! the entry is still inside its validity window, otherwise it goes to the
//! network (conditionally when a validator is known) through the shared
//! [`Throttle`], retrying transient failures with exponential backoff.

pub mod cache;
pub mod throttle;

pub use cache::{CacheEntry, CacheStore};
pub use throttle::{origin_of, OriginThrottle, Throttle, Unthrottled};

use crate::config::FetchSettings;
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pmda_common::checksum::sha256_hex;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// How long a cached copy may be served without asking the origin
    pub cache_ttl: Duration,
    /// Ignore the cache entirely and download again
    pub force_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub url: String,
    pub payload: Bytes,
    /// ETag or Last-Modified reported by the origin
    pub validator: Option<String>,
    /// SHA-256 of the payload
    pub content_hash: String,
    pub from_cache: bool,
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResource>;
}

/// Bounded retries with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Seconds; attempt `n` waits `backoff_factor * 2^(n-1)`
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        Duration::from_secs_f64((self.backoff_factor * exp).max(0.0))
    }
}

enum HttpOutcome {
    NotModified,
    Body {
        payload: Bytes,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Option<CacheStore>,
    throttle: Arc<dyn Throttle>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(
        settings: &FetchSettings,
        cache: Option<CacheStore>,
        throttle: Arc<dyn Throttle>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EtlError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache,
            throttle,
            retry: RetryPolicy {
                retries: settings.retries,
                backoff_factor: settings.backoff_factor,
            },
        })
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    async fn send_with_retry(&self, url: &str, conditional: Option<&CacheEntry>) -> Result<HttpOutcome> {
        let origin = origin_of(url);
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.throttle.acquire(&origin).await;

            let err = match self.send_once(url, conditional).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                url = %url,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(&self, url: &str, conditional: Option<&CacheEntry>) -> Result<HttpOutcome> {
        let mut request = self.client.get(url);
        if let Some(entry) = conditional {
            if let Some(etag) = &entry.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &entry.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await.map_err(|e| transport_error(url, &e))?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(HttpOutcome::NotModified);
        }
        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(EtlError::fetch(url, format!("HTTP {}", status), retryable));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let payload = response.bytes().await.map_err(|e| transport_error(url, &e))?;

        Ok(HttpOutcome::Body {
            payload,
            etag,
            last_modified,
        })
    }

    async fn from_cache(&self, entry: &CacheEntry) -> Result<Option<FetchedResource>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        Ok(cache
            .read_payload(entry)
            .await?
            .map(|payload| FetchedResource {
                url: entry.url.clone(),
                payload,
                validator: entry.validator().map(str::to_string),
                content_hash: entry.content_hash.clone(),
                from_cache: true,
            }))
    }
}

fn transport_error(url: &str, e: &reqwest::Error) -> EtlError {
    let retryable = e.is_timeout() || e.is_connect() || e.is_request() || e.is_body();
    EtlError::fetch(url, e.to_string(), retryable)
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResource> {
        let url = request.url.as_str();

        let mut stale = None;
        if let (Some(cache), false) = (&self.cache, request.force_refresh) {
            if let Some(entry) = cache.lookup(url).await? {
                if entry.is_fresh(request.cache_ttl) {
                    if let Some(hit) = self.from_cache(&entry).await? {
                        debug!(url = %url, "Served from cache");
                        return Ok(hit);
                    }
                } else {
                    stale = Some(entry);
                }
            }
        }

        let mut outcome = self.send_with_retry(url, stale.as_ref()).await?;
        let not_modified = matches!(outcome, HttpOutcome::NotModified);
        if let (true, Some(entry)) = (not_modified, stale.as_ref()) {
            if let Some(hit) = self.from_cache(entry).await? {
                if let Some(cache) = &self.cache {
                    cache.touch(url).await?;
                }
                debug!(url = %url, "Origin reported not modified");
                return Ok(hit);
            }
            // the cached payload vanished, so ask again without validators
            outcome = self.send_with_retry(url, None).await?;
        }

        match outcome {
            HttpOutcome::Body {
                payload,
                etag,
                last_modified,
            } => {
                if let Some(cache) = &self.cache {
                    cache
                        .store(url, url, etag.as_deref(), last_modified.as_deref(), &payload)
                        .await?;
                }
                info!(url = %url, bytes = payload.len(), "Fetched resource");
                Ok(FetchedResource {
                    url: url.to_string(),
                    content_hash: sha256_hex(&payload),
                    validator: etag.or(last_modified),
                    payload,
                    from_cache: false,
                })
            },
            HttpOutcome::NotModified => Err(EtlError::fetch(
                url,
                "origin answered 304 to an unconditional request",
                false,
            )),
        }
    }
}
