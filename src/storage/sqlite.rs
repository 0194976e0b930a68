//! SQLite transactional record store.
//!
//! Each slice value is one `{key, value, timestamp}` record in the
//! `state_records` table. Reads and writes each open a short-lived
//! transaction. The `timestamp` index backs recency listing and cleanup.
//!
//! Features:
//! - WAL mode for concurrent readers from several app windows
//! - Recency-ordered enumeration and age/count based cleanup
//! - Storage usage estimate against an optional quota

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, StateError};
use crate::storage::{validate_key, StorageAdapter};
use crate::value::{now_millis, StateValue};

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// The storage key.
    pub key: String,
    /// The stored value.
    pub value: StateValue,
    /// Last write time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Result of [`SqliteAdapter::estimate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEstimate {
    /// Bytes currently used by the database.
    pub usage_bytes: u64,
    /// Configured quota, if any.
    pub quota_bytes: Option<u64>,
}

impl StorageEstimate {
    /// Fraction of the quota in use, if a quota is configured.
    pub fn usage_ratio(&self) -> Option<f64> {
        self.quota_bytes
            .filter(|q| *q > 0)
            .map(|q| self.usage_bytes as f64 / q as f64)
    }
}

/// SQLite implementation of [`StorageAdapter`].
pub struct SqliteAdapter {
    pool: SqlitePool,
    quota_bytes: Option<u64>,
}

impl SqliteAdapter {
    /// Open or create a SQLite database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite state store at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StateError::StorageUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StateError::StorageUnavailable(e.to_string()))?;

        let adapter = Self {
            pool,
            quota_bytes: None,
        };
        adapter.init_schema().await?;
        Ok(adapter)
    }

    /// Create an in-memory database (for testing).
    ///
    /// The pool keeps a single connection alive for its whole lifetime;
    /// an in-memory database disappears with its connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StateError::StorageUnavailable(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StateError::StorageUnavailable(e.to_string()))?;

        let adapter = Self {
            pool,
            quota_bytes: None,
        };
        adapter.init_schema().await?;
        Ok(adapter)
    }

    /// Report usage against `bytes` in [`estimate`](Self::estimate).
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_records (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_state_records_timestamp ON state_records(timestamp);
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    fn decode(raw: &str) -> Result<StateValue> {
        Ok(serde_json::from_str(raw)?)
    }

    async fn commit(tx: sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| StateError::TransactionFailed(e.to_string()))
    }

    /// Insert or replace a record, keeping its timestamp.
    pub async fn put_record(&self, record: &StoredRecord) -> Result<()> {
        validate_key(&record.key)?;
        let encoded = serde_json::to_string(&record.value)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO state_records (key, value, timestamp)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(&record.key)
        .bind(&encoded)
        .bind(record.timestamp as i64)
        .execute(&mut *tx)
        .await?;
        Self::commit(tx).await
    }

    /// All records, most recently written first.
    pub async fn get_all_entries(&self) -> Result<Vec<StoredRecord>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT key, value, timestamp FROM state_records ORDER BY timestamp DESC, key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, value, timestamp)| {
                Ok(StoredRecord {
                    key,
                    value: Self::decode(&value)?,
                    timestamp: timestamp.max(0) as u64,
                })
            })
            .collect()
    }

    /// Delete records older than `max_age` and/or beyond the `max_count`
    /// most recent. Returns the number of records deleted.
    pub async fn cleanup(&self, max_age: Option<Duration>, max_count: Option<usize>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        if let Some(age) = max_age {
            let cutoff = now_millis().saturating_sub(age.as_millis() as u64);
            deleted += sqlx::query("DELETE FROM state_records WHERE timestamp < ?")
                .bind(cutoff as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        if let Some(count) = max_count {
            deleted += sqlx::query(
                r#"
                DELETE FROM state_records WHERE key NOT IN (
                    SELECT key FROM state_records ORDER BY timestamp DESC, key LIMIT ?
                )
                "#,
            )
            .bind(count as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        Self::commit(tx).await?;
        info!(deleted, ?max_age, ?max_count, "state record cleanup complete");
        Ok(deleted)
    }

    /// Estimate bytes used by the database.
    pub async fn estimate(&self) -> Result<StorageEstimate> {
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        Ok(StorageEstimate {
            usage_bytes: (page_count.max(0) as u64) * (page_size.max(0) as u64),
            quota_bytes: self.quota_bytes,
        })
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<StateValue>> {
        validate_key(key)?;

        let mut tx = self.pool.begin().await?;
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM state_records WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        Self::commit(tx).await?;

        row.map(|(raw,)| Self::decode(&raw)).transpose()
    }

    async fn set(&self, key: &str, value: &StateValue) -> Result<()> {
        self.put_record(&StoredRecord {
            key: key.to_string(),
            value: value.clone(),
            timestamp: now_millis(),
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM state_records WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        Self::commit(tx).await
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM state_records")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        Self::commit(tx).await?;
        debug!(removed, "cleared state records");
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM state_records ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM state_records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: &str, value: StateValue, timestamp: u64) -> StoredRecord {
        StoredRecord {
            key: key.to_string(),
            value,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_sqlite_set_and_get() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();

        let value = json!({"order": 4, "delays": [7, 10]});
        adapter.set("dda.params", &value).await.unwrap();

        assert_eq!(adapter.get("dda.params").await.unwrap(), Some(value));
        assert!(adapter.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_overwrite_and_remove() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();

        adapter.set("k", &json!(1)).await.unwrap();
        adapter.set("k", &json!(2)).await.unwrap();
        assert_eq!(adapter.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(adapter.get_all_keys().await.unwrap(), vec!["k"]);

        adapter.remove("k").await.unwrap();
        assert!(!adapter.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_clear() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();

        adapter.set("a", &json!("x")).await.unwrap();
        adapter.set("b", &json!("y")).await.unwrap();
        adapter.clear().await.unwrap();

        assert!(adapter.get_all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_sorted_by_recency() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();

        adapter.put_record(&record("old", json!(1), 1_000)).await.unwrap();
        adapter.put_record(&record("new", json!(3), 3_000)).await.unwrap();
        adapter.put_record(&record("mid", json!(2), 2_000)).await.unwrap();

        let keys: Vec<String> = adapter
            .get_all_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_cleanup_by_count() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();
        for i in 0..5u64 {
            adapter
                .put_record(&record(&format!("k{i}"), json!(i), 1_000 + i))
                .await
                .unwrap();
        }

        let deleted = adapter.cleanup(None, Some(2)).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(adapter.get_all_keys().await.unwrap(), vec!["k3", "k4"]);
    }

    #[tokio::test]
    async fn test_cleanup_by_age() {
        let adapter = SqliteAdapter::in_memory().await.unwrap();
        let now = now_millis();

        adapter.put_record(&record("stale", json!(0), now - 3_600_000)).await.unwrap();
        adapter.set("fresh", &json!(1)).await.unwrap();

        let deleted = adapter
            .cleanup(Some(Duration::from_secs(60)), None)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(adapter.has("fresh").await.unwrap());
        assert!(!adapter.has("stale").await.unwrap());
    }

    #[tokio::test]
    async fn test_estimate_reports_quota() {
        let adapter = SqliteAdapter::in_memory().await.unwrap().with_quota(50 * 1024 * 1024);
        adapter.set("k", &json!("v")).await.unwrap();

        let estimate = adapter.estimate().await.unwrap();
        assert!(estimate.usage_bytes > 0);
        assert_eq!(estimate.quota_bytes, Some(50 * 1024 * 1024));
        assert!(estimate.usage_ratio().unwrap() < 1.0);
    }

    #[tokio::test]
    async fn test_sqlite_file_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let adapter = SqliteAdapter::open(&path).await.unwrap();
            adapter.set("ui.theme", &json!("dark")).await.unwrap();
        }

        let adapter = SqliteAdapter::open(&path).await.unwrap();
        assert_eq!(adapter.get("ui.theme").await.unwrap(), Some(json!("dark")));
    }
}
