//! Cache store for Markwise, backed by embedded libSQL.
//!
//! [`CacheStore`] is the contract the pipeline consumes: `get`/`put` keyed by
//! `(url, stage)` with lazy TTL expiry. [`Storage`] is the durable libSQL
//! implementation; [`MemoryCache`] is an in-process map for tests and
//! cache-less runs.
//!
//! **Access rules:**
//! - `markwise organize` and cache admin commands: read-write via [`Storage::open`]
//! - `markwise cache stats`: read-only via [`Storage::open_readonly`]

mod memory;
mod migrations;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use markwise_shared::{CacheEntry, MarkwiseError, Result, Stage, cache_key};
use serde::Serialize;
use tokio::sync::Mutex;

pub use memory::MemoryCache;

// ---------------------------------------------------------------------------
// CacheStore contract
// ---------------------------------------------------------------------------

/// Key-value cache shared by all pipeline workers.
///
/// Implementations must be safe to call concurrently and must never hand out
/// a partially written payload.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the live entry for `(url, stage)`. Expired entries read as absent.
    async fn get(&self, url: &str, stage: Stage) -> Result<Option<CacheEntry>>;

    /// Store `payload`, superseding any existing entry for `(url, stage)`.
    async fn put(&self, url: &str, stage: Stage, payload: &str, ttl: Duration) -> Result<()>;
}

/// Counts reported by `markwise cache stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub scrape_entries: u64,
    pub metadata_entries: u64,
    /// Rows past their TTL that have not been purged yet.
    pub expired_entries: u64,
    /// Sum of `cost_units` over live metadata entries.
    pub total_tokens: u64,
}

impl CacheStats {
    pub fn live_entries(&self) -> u64 {
        self.scrape_entries + self.metadata_entries
    }
}

/// Fixed-width UTC timestamp so TEXT comparison in SQL matches time order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Latest expiry written. Years past 9999 would break the fixed-width
/// [`timestamp`] ordering.
pub(crate) fn max_expiry() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map_or_else(max_expiry, |at| at.min(max_expiry()))
}

fn db_err(e: impl std::fmt::Display) -> MarkwiseError {
    MarkwiseError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// Storage (libSQL)
// ---------------------------------------------------------------------------

/// Durable cache handle wrapping a libSQL database.
///
/// Statements on the shared connection run one at a time behind an async
/// mutex; each statement is atomic, so readers see either the old or the new
/// payload for a key.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    lock: Mutex<()>,
    path: PathBuf,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MarkwiseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            lock: Mutex::new(()),
            path: path.to_path_buf(),
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MarkwiseError::Storage(format!(
                "cache database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            lock: Mutex::new(()),
            path: path.to_path_buf(),
            readonly: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    MarkwiseError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MarkwiseError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admin operations
    // -----------------------------------------------------------------------

    /// Live entries per stage, unpurged expired rows and recorded tokens.
    pub async fn stats(&self) -> Result<CacheStats> {
        let now = timestamp(Utc::now());
        let _guard = self.lock.lock().await;

        let mut stats = CacheStats::default();
        let mut rows = self
            .conn
            .query(
                "SELECT stage, COUNT(*) FROM cache_entries WHERE expires_at >= ?1 GROUP BY stage",
                params![now.as_str()],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let stage: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            match stage.parse::<Stage>()? {
                Stage::Scrape => stats.scrape_entries = count as u64,
                Stage::Metadata => stats.metadata_entries = count as u64,
            }
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM cache_entries WHERE expires_at < ?1",
                params![now.as_str()],
            )
            .await
            .map_err(db_err)?;
        if let Some(row) = rows.next().await.map_err(db_err)? {
            stats.expired_entries = row.get::<i64>(0).map_err(db_err)? as u64;
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(CASE WHEN json_valid(payload)
                     THEN json_extract(payload, '$.cost_units') END), 0)
                 FROM cache_entries WHERE stage = 'metadata' AND expires_at >= ?1",
                params![now.as_str()],
            )
            .await
            .map_err(db_err)?;
        if let Some(row) = rows.next().await.map_err(db_err)? {
            stats.total_tokens = row.get::<i64>(0).unwrap_or(0).max(0) as u64;
        }

        Ok(stats)
    }

    /// Delete every entry. Returns the number of rows removed.
    pub async fn clear(&self) -> Result<u64> {
        self.check_writable()?;
        let _guard = self.lock.lock().await;
        self.conn
            .execute("DELETE FROM cache_entries", params![])
            .await
            .map_err(db_err)
    }

    /// Delete rows past their TTL. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.check_writable()?;
        let now = timestamp(Utc::now());
        let _guard = self.lock.lock().await;
        let removed = self
            .conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at < ?1",
                params![now.as_str()],
            )
            .await
            .map_err(db_err)?;
        tracing::debug!(removed, "purged expired cache entries");
        Ok(removed)
    }

    /// Drop both stages cached for `url`. Returns the number of rows removed.
    pub async fn invalidate(&self, url: &str) -> Result<u64> {
        self.check_writable()?;
        let _guard = self.lock.lock().await;
        self.conn
            .execute("DELETE FROM cache_entries WHERE url = ?1", params![url])
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl CacheStore for Storage {
    async fn get(&self, url: &str, stage: Stage) -> Result<Option<CacheEntry>> {
        let key = cache_key(url, stage);
        let _guard = self.lock.lock().await;

        let mut rows = self
            .conn
            .query(
                "SELECT key, url, stage, payload, created_at, expires_at
                 FROM cache_entries WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(db_err)?;

        let entry = match rows.next().await.map_err(db_err)? {
            Some(row) => row_to_entry(&row)?,
            None => return Ok(None),
        };
        drop(rows);

        if entry.is_expired_at(Utc::now()) {
            // Only remove the row we saw, not one a concurrent put just wrote.
            if !self.readonly {
                self.conn
                    .execute(
                        "DELETE FROM cache_entries WHERE key = ?1 AND expires_at = ?2",
                        params![key.as_str(), timestamp(entry.expires_at)],
                    )
                    .await
                    .map_err(db_err)?;
            }
            tracing::debug!(url, stage = %stage, "cache entry expired");
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn put(&self, url: &str, stage: Stage, payload: &str, ttl: Duration) -> Result<()> {
        self.check_writable()?;
        let key = cache_key(url, stage);
        let now = Utc::now();
        let created_at = timestamp(now);
        let expires_at = timestamp(expiry(now, ttl));

        let _guard = self.lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO cache_entries (key, url, stage, payload, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                   payload = excluded.payload,
                   created_at = excluded.created_at,
                   expires_at = excluded.expires_at",
                params![
                    key.as_str(),
                    url,
                    stage.as_str(),
                    payload,
                    created_at.as_str(),
                    expires_at.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Convert a database row to a [`CacheEntry`].
fn row_to_entry(row: &libsql::Row) -> Result<CacheEntry> {
    let parse_ts = |idx: i32| -> Result<DateTime<Utc>> {
        let s: String = row.get(idx).map_err(db_err)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| MarkwiseError::Storage(format!("invalid date: {e}")))
    };

    Ok(CacheEntry {
        key: row.get::<String>(0).map_err(db_err)?,
        url: row.get::<String>(1).map_err(db_err)?,
        stage: row.get::<String>(2).map_err(db_err)?.parse()?,
        payload: row.get::<String>(3).map_err(db_err)?,
        created_at: parse_ts(4)?,
        expires_at: parse_ts(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    const DAY: Duration = Duration::from_secs(86_400);

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mw_test_{}.db", Uuid::now_v7()))
    }

    async fn test_storage() -> Storage {
        Storage::open(&temp_db_path()).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_db_path();
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn get_returns_exact_payload_after_put() {
        let storage = test_storage().await;
        let payloads = [
            ("https://a.dev/", Stage::Scrape, r#"{"url":"https://a.dev/","text":"héllo ✓"}"#),
            ("https://a.dev/", Stage::Metadata, r#"{"name":"A","description":"B"}"#),
            ("https://b.dev/?q=1&x=2", Stage::Scrape, ""),
        ];

        for (url, stage, payload) in payloads {
            storage.put(url, stage, payload, DAY).await.expect("put");
        }
        for (url, stage, payload) in payloads {
            let entry = storage.get(url, stage).await.expect("get").expect("hit");
            assert_eq!(entry.payload, payload);
            assert_eq!(entry.url, url);
            assert_eq!(entry.stage, stage);
            assert_eq!(entry.key, cache_key(url, stage));
        }

        assert!(storage.get("https://c.dev/", Stage::Scrape).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_supersedes_existing_entry() {
        let storage = test_storage().await;
        storage.put("https://a.dev", Stage::Metadata, "old", DAY).await.unwrap();
        storage.put("https://a.dev", Stage::Metadata, "new", DAY).await.unwrap();

        let entry = storage.get("https://a.dev", Stage::Metadata).await.unwrap().unwrap();
        assert_eq!(entry.payload, "new");
        assert_eq!(storage.stats().await.unwrap().metadata_entries, 1);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent_and_is_removed() {
        let storage = test_storage().await;
        storage
            .put("https://a.dev", Stage::Scrape, "stale", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(storage.stats().await.unwrap().expired_entries, 1);
        assert!(storage.get("https://a.dev", Stage::Scrape).await.unwrap().is_none());
        assert_eq!(storage.stats().await.unwrap().expired_entries, 0);
    }

    #[tokio::test]
    async fn stats_counts_stages_and_tokens() {
        let storage = test_storage().await;
        storage.put("https://a.dev", Stage::Scrape, "{}", DAY).await.unwrap();
        storage
            .put("https://a.dev", Stage::Metadata, r#"{"cost_units":120}"#, DAY)
            .await
            .unwrap();
        storage
            .put("https://b.dev", Stage::Metadata, r#"{"cost_units":30}"#, DAY)
            .await
            .unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.scrape_entries, 1);
        assert_eq!(stats.metadata_entries, 2);
        assert_eq!(stats.live_entries(), 3);
        assert_eq!(stats.total_tokens, 150);
    }

    #[tokio::test]
    async fn stats_tolerate_undecodable_metadata_payloads() {
        let storage = test_storage().await;
        storage.put("https://a.dev", Stage::Metadata, "not json", DAY).await.unwrap();
        storage
            .put("https://b.dev", Stage::Metadata, r#"{"cost_units":30}"#, DAY)
            .await
            .unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.metadata_entries, 2);
        assert_eq!(stats.total_tokens, 30);
    }

    #[test]
    fn expiry_stays_within_four_digit_years() {
        let now = Utc::now();
        let far = expiry(now, Duration::MAX);
        assert_eq!(far, max_expiry());
        assert!(timestamp(far).starts_with("9999-12-31T23:59:59"));
        assert!(timestamp(far) > timestamp(now));
        assert_eq!(expiry(now, DAY), now + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn unbounded_ttl_never_counts_as_expired() {
        let storage = test_storage().await;
        storage.put("https://a.dev", Stage::Scrape, "{}", Duration::MAX).await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.scrape_entries, 1);
        assert_eq!(stats.expired_entries, 0);
        assert_eq!(storage.purge_expired().await.unwrap(), 0);
        assert!(storage.get("https://a.dev", Stage::Scrape).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_purge_and_clear() {
        let storage = test_storage().await;
        storage.put("https://a.dev", Stage::Scrape, "a", DAY).await.unwrap();
        storage.put("https://a.dev", Stage::Metadata, "a", DAY).await.unwrap();
        storage.put("https://b.dev", Stage::Scrape, "b", DAY).await.unwrap();
        storage
            .put("https://c.dev", Stage::Scrape, "c", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(storage.invalidate("https://a.dev").await.unwrap(), 2);
        assert_eq!(storage.purge_expired().await.unwrap(), 1);
        assert!(storage.get("https://b.dev", Stage::Scrape).await.unwrap().is_some());

        assert_eq!(storage.clear().await.unwrap(), 1);
        assert_eq!(storage.stats().await.unwrap(), CacheStats::default());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_db_path();
        let rw = Storage::open(&tmp).await.unwrap();
        rw.put("https://a.dev", Stage::Scrape, "a", DAY).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get("https://a.dev", Stage::Scrape).await.unwrap().is_some());
        let result = ro.put("https://b.dev", Stage::Scrape, "b", DAY).await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        assert!(Storage::open_readonly(&temp_db_path()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_live_entry() {
        let storage = Arc::new(test_storage().await);
        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let payload = format!(r#"{{"writer":{i}}}"#);
                storage
                    .put("https://shared.dev", Stage::Scrape, &payload, DAY)
                    .await
                    .expect("concurrent put");
                storage
                    .get("https://shared.dev", Stage::Scrape)
                    .await
                    .expect("concurrent get")
                    .expect("entry present")
            }));
        }

        for handle in handles {
            let entry = handle.await.expect("join");
            let parsed: serde_json::Value =
                serde_json::from_str(&entry.payload).expect("payload is never torn");
            assert!(parsed["writer"].is_u64());
        }
        assert_eq!(storage.stats().await.unwrap().scrape_entries, 1);
    }
}
