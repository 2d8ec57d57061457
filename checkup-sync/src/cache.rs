//! Local persistent cache for the patient record
//!
//! Provides:
//! - One durable snapshot of the record under a well-known key
//! - Wholesale overwrite on every mutation, wholesale removal on full reset
//! - An in-memory variant for embedding and tests

use crate::error::SyncResult;
use crate::record::PatientRecord;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

/// Key under which the record snapshot is stored
pub const PATIENT_DATA_KEY: &str = "patientData";

/// Durable key-value snapshot of the patient record
#[async_trait]
pub trait RecordCache: Send + Sync {
    /// Read the stored snapshot; `None` means start empty.
    async fn load(&self) -> SyncResult<Option<PatientRecord>>;

    /// Overwrite the stored snapshot.
    async fn store(&self, record: &PatientRecord) -> SyncResult<()>;

    /// Remove the stored snapshot.
    async fn clear(&self) -> SyncResult<()>;
}

/// Configuration for the SQLite-backed cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: "checkup_local.db".to_string(),
            max_connections: 1,
            enable_wal: true,
        }
    }
}

/// SQLite-backed record cache
pub struct SqliteRecordCache {
    pool: SqlitePool,
    key: String,
}

impl SqliteRecordCache {
    /// Open (creating if needed) the cache database.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Cache`] if the database cannot be opened or initialized.
    pub async fn new(config: &CacheConfig) -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true)
            .journal_mode(if config.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            });

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let cache = Self {
            pool,
            key: PATIENT_DATA_KEY.to_string(),
        };
        cache.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local record cache");
        Ok(cache)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close database connections
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordCache for SqliteRecordCache {
    async fn load(&self) -> SyncResult<Option<PatientRecord>> {
        let row = sqlx::query("SELECT value FROM local_storage WHERE key = ?")
            .bind(&self.key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;

        match serde_json::from_str(&value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Discarding unreadable cached record");
                Ok(None)
            }
        }
    }

    async fn store(&self, record: &PatientRecord) -> SyncResult<()> {
        let value = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO local_storage (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.key)
        .bind(&value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(key = %self.key, bytes = value.len(), "Cached record snapshot");
        Ok(())
    }

    async fn clear(&self) -> SyncResult<()> {
        sqlx::query("DELETE FROM local_storage WHERE key = ?")
            .bind(&self.key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local cache keeping the serialized snapshot in memory
#[derive(Default)]
pub struct MemoryRecordCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryRecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored JSON, if any
    pub fn raw(&self) -> Option<String> {
        self.entries.lock().get(PATIENT_DATA_KEY).cloned()
    }

    /// Store raw text under the record key, bypassing serialization
    pub fn put_raw(&self, value: impl Into<String>) {
        self.entries
            .lock()
            .insert(PATIENT_DATA_KEY.to_string(), value.into());
    }
}

#[async_trait]
impl RecordCache for MemoryRecordCache {
    async fn load(&self) -> SyncResult<Option<PatientRecord>> {
        let Some(raw) = self.raw() else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable cached record");
                Ok(None)
            }
        }
    }

    async fn store(&self, record: &PatientRecord) -> SyncResult<()> {
        let value = serde_json::to_string(record)?;
        self.entries.lock().insert(PATIENT_DATA_KEY.to_string(), value);
        Ok(())
    }

    async fn clear(&self) -> SyncResult<()> {
        self.entries.lock().remove(PATIENT_DATA_KEY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Department, SlicePatch};
    use tempfile::TempDir;

    async fn create_test_cache(dir: &TempDir) -> SqliteRecordCache {
        let config = CacheConfig {
            db_path: dir.path().join("cache.db").to_str().unwrap().to_string(),
            max_connections: 1,
            enable_wal: true,
        };
        SqliteRecordCache::new(&config).await.unwrap()
    }

    fn sample_record() -> PatientRecord {
        let mut record = PatientRecord::new();
        record.patient_id = Some("P100".to_string());
        record.merge_patch(Department::Vision, &SlicePatch::new().set("re_vision", "6/6"));
        record.touch();
        record
    }

    #[tokio::test]
    async fn test_empty_cache_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = create_test_cache(&dir).await;
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_load_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let cache = create_test_cache(&dir).await;

        let mut record = sample_record();
        cache.store(&record).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), Some(record.clone()));

        record.merge_patch(Department::Ent, &SlicePatch::new().set("throat", "Normal"));
        cache.store(&record).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_clear_removes_entry() {
        let dir = TempDir::new().unwrap();
        let cache = create_test_cache(&dir).await;

        cache.store(&sample_record()).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let record = sample_record();
        {
            let cache = create_test_cache(&dir).await;
            cache.store(&record).await.unwrap();
            cache.close().await;
        }

        let reopened = create_test_cache(&dir).await;
        assert_eq!(reopened.load().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_treated_as_absent() {
        let cache = MemoryRecordCache::new();
        cache.put_raw("{not json");
        assert!(cache.load().await.unwrap().is_none());
    }
}
