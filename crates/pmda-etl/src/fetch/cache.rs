//! Fetch cache
//!
//! SQLite index of cached resources plus payload files on disk, named by the
//! SHA-256 of the resource key. An entry is served without a network round
//! trip while it is younger than the dataset's TTL; after that its ETag or
//! Last-Modified validator drives a conditional re-fetch.

use crate::error::{EtlError, Result};
use bytes::Bytes;
use chrono::Utc;
use pmda_common::checksum::{sha256_hex, verify_sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Cache index record
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CacheEntry {
    pub resource_key: String,
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: String,
    pub size: i64,
    pub path: String,
    /// Unix seconds
    pub fetched_at: i64,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        let secs = Utc::now().timestamp().saturating_sub(self.fetched_at);
        Duration::from_secs(u64::try_from(secs).unwrap_or(0))
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    /// The validator a conditional request would send
    pub fn validator(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

pub struct CacheStore {
    pool: SqlitePool,
    root: PathBuf,
}

impl CacheStore {
    /// Open (or create) the cache rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("payloads")).await?;

        let options = SqliteConnectOptions::new()
            .filename(root.join("index.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, root).await
    }

    /// Cache with an in-memory index, for tests and throwaway runs
    pub async fn in_memory(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("payloads")).await?;

        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        // a memory database lives and dies with its single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, root).await
    }

    async fn with_pool(pool: SqlitePool, root: PathBuf) -> Result<Self> {
        sqlx::migrate!("./migrations/cache")
            .run(&pool)
            .await
            .map_err(|e| EtlError::cache(format!("cache migration failed: {}", e)))?;
        Ok(Self { pool, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.root.join("payloads").join(sha256_hex(key))
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            r#"
            SELECT resource_key, url, etag, last_modified, content_hash, size, path, fetched_at
            FROM cache_entries WHERE resource_key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Cached payload, or `None` when the file is gone or no longer matches
    /// the recorded hash
    pub async fn read_payload(&self, entry: &CacheEntry) -> Result<Option<Bytes>> {
        let data = match tokio::fs::read(&entry.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = verify_sha256(&data, &entry.content_hash) {
            warn!(key = %entry.resource_key, error = %e, "Cached payload is corrupt, ignoring");
            return Ok(None);
        }

        Ok(Some(Bytes::from(data)))
    }

    /// Write a payload and upsert its index entry
    pub async fn store(
        &self,
        key: &str,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        payload: &Bytes,
    ) -> Result<CacheEntry> {
        let path = self.payload_path(key);
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let entry = CacheEntry {
            resource_key: key.to_string(),
            url: url.to_string(),
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
            content_hash: sha256_hex(payload),
            size: payload.len() as i64,
            path: path.to_string_lossy().to_string(),
            fetched_at: Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO cache_entries
                (resource_key, url, etag, last_modified, content_hash, size, path, fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(resource_key) DO UPDATE SET
                url = excluded.url,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                content_hash = excluded.content_hash,
                size = excluded.size,
                path = excluded.path,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&entry.resource_key)
        .bind(&entry.url)
        .bind(&entry.etag)
        .bind(&entry.last_modified)
        .bind(&entry.content_hash)
        .bind(entry.size)
        .bind(&entry.path)
        .bind(entry.fetched_at)
        .execute(&self.pool)
        .await?;

        debug!(key = %key, size = entry.size, "Payload cached");
        Ok(entry)
    }

    /// Restart an entry's validity window after the origin confirmed it (304)
    pub async fn touch(&self, key: &str) -> Result<()> {
        sqlx::query("UPDATE cache_entries SET fetched_at = ?1 WHERE resource_key = ?2")
            .bind(Utc::now().timestamp())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Evict entries older than `age`; returns how many were removed
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
        let stale: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM cache_entries WHERE fetched_at < ?1")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;

        for (path,) in &stale {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path, error = %e, "Failed to remove cached payload");
                }
            }
        }

        let removed = sqlx::query("DELETE FROM cache_entries WHERE fetched_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_cache() -> (CacheStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = CacheStore::in_memory(temp_dir.path()).await.unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let (cache, _temp) = create_test_cache().await;
        let payload = Bytes::from_static(b"approval_id,brand\nA-1,X\n");

        let stored = cache
            .store("https://x/a.csv", "https://x/a.csv", Some("\"v1\""), None, &payload)
            .await
            .unwrap();

        let entry = cache.lookup("https://x/a.csv").await.unwrap().unwrap();
        assert_eq!(entry, stored);
        assert_eq!(entry.validator(), Some("\"v1\""));
        assert!(entry.is_fresh(Duration::from_secs(60)));
        assert!(!entry.is_fresh(Duration::ZERO));

        let read = cache.read_payload(&entry).await.unwrap().unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_open_on_disk_index() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::open(temp.path().join("cache")).await.unwrap();
        cache
            .store("k", "https://x/k", None, Some("Wed, 01 Jan 2025 00:00:00 GMT"), &Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(temp.path().join("cache").join("index.db").exists());
        assert_eq!(
            cache.lookup("k").await.unwrap().unwrap().validator(),
            Some("Wed, 01 Jan 2025 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_a_miss() {
        let (cache, _temp) = create_test_cache().await;
        let entry = cache
            .store("k", "https://x/k", None, None, &Bytes::from_static(b"original"))
            .await
            .unwrap();
        tokio::fs::write(&entry.path, b"tampered").await.unwrap();

        assert!(cache.read_payload(&entry).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_payload_file_is_a_miss() {
        let (cache, _temp) = create_test_cache().await;
        let entry = cache
            .store("k", "https://x/k", None, None, &Bytes::from_static(b"data"))
            .await
            .unwrap();
        tokio::fs::remove_file(&entry.path).await.unwrap();

        assert!(cache.read_payload(&entry).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let (cache, _temp) = create_test_cache().await;
        let entry = cache
            .store("old", "https://x/old", None, None, &Bytes::from_static(b"old"))
            .await
            .unwrap();
        sqlx::query("UPDATE cache_entries SET fetched_at = fetched_at - 7200")
            .execute(&cache.pool)
            .await
            .unwrap();
        cache
            .store("new", "https://x/new", None, None, &Bytes::from_static(b"new"))
            .await
            .unwrap();

        let removed = cache.purge_older_than(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup("old").await.unwrap().is_none());
        assert!(cache.lookup("new").await.unwrap().is_some());
        assert!(!Path::new(&entry.path).exists());
    }
}
