// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite backend for the durable tier and the operation queue.
//!
//! One table holds every key, with the serialized JSON value and its
//! accounted size so quota checks don't need to re-serialize:
//!
//! ```sql
//! CREATE TABLE kv_entries (
//!   entry_key  TEXT PRIMARY KEY,
//!   value      TEXT NOT NULL,     -- JSON as text (sqlx Any driver limitation)
//!   size       INTEGER NOT NULL,  -- key bytes + value bytes
//!   updated_at INTEGER NOT NULL   -- epoch millis
//! )
//! ```
//!
//! Writes run inside a transaction: the quota check and the upsert see the
//! same snapshot of `SUM(size)`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{check_capacity, entry_size, KvStore, StorageError, StorageUsage};
use crate::resilience::retry::{retry, retry_when, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn text_column(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok()
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_entries (
        entry_key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        size INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

const UPSERT: &str = "INSERT INTO kv_entries (entry_key, value, size, updated_at) VALUES (?, ?, ?, ?) \
     ON CONFLICT(entry_key) DO UPDATE SET value = excluded.value, size = excluded.size, updated_at = excluded.updated_at";

pub struct SqlStore {
    name: String,
    pool: AnyPool,
    capacity: Option<u64>,
}

impl SqlStore {
    /// Connect to a `sqlite:` URL with startup-mode retry (fails fast if
    /// the URL is wrong).
    pub async fn new(connection_string: &str, capacity: Option<u64>) -> Result<Self, StorageError> {
        if !connection_string.starts_with("sqlite:") {
            return Err(StorageError::Backend(format!(
                "Unsupported connection string '{}': only sqlite: URLs are supported",
                connection_string
            )));
        }
        install_drivers();

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self {
            name: "durable".to_string(),
            pool,
            capacity,
        };

        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Open (or create) a SQLite file.
    pub async fn open_sqlite(path: &str, capacity: Option<u64>) -> Result<Self, StorageError> {
        Self::new(&format!("sqlite://{}?mode=rwc", path), capacity).await
    }

    /// Rename the store (shows up in logs and tier metrics).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Close the pool, flushing SQLite's WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    ///
    /// Readers don't block the writer, and a crash mid-write leaves the
    /// previous committed state intact.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(SCHEMA).execute(&self.pool).await.map_err(backend)
        })
        .await?;

        Ok(())
    }

    async fn write_once(&self, key: &str, json: &str, size: u64) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        if self.capacity.is_some() {
            let used: i64 = sqlx::query("SELECT COALESCE(SUM(size), 0) AS used FROM kv_entries")
                .fetch_one(&mut *tx)
                .await
                .map_err(backend)?
                .try_get("used")
                .unwrap_or(0);
            let replaced: i64 = sqlx::query("SELECT size FROM kv_entries WHERE entry_key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?
                .and_then(|row| row.try_get("size").ok())
                .unwrap_or(0);

            check_capacity(self.capacity, used.max(0) as u64, replaced.max(0) as u64, size)?;
        }

        let now_millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        sqlx::query(UPSERT)
            .bind(key)
            .bind(json)
            .bind(size as i64)
            .bind(now_millis)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)
    }
}

#[async_trait]
impl KvStore for SqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let row = retry("sql_read", &RetryConfig::query(), || async {
            sqlx::query("SELECT value FROM kv_entries WHERE entry_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        match row {
            Some(row) => {
                let json = text_column(&row, "value")
                    .ok_or_else(|| StorageError::Backend(format!("No value in row for '{}'", key)))?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        let size = entry_size(key, value)?;

        // Quota failures are final; only backend errors are worth retrying
        retry_when(
            "sql_write",
            &RetryConfig::query(),
            || self.write_once(key, &json, size),
            |e: &StorageError| !e.is_capacity(),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        retry("sql_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM kv_entries WHERE entry_key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        retry("sql_clear", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM kv_entries")
                .execute(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let rows = retry("sql_keys", &RetryConfig::query(), || async {
            sqlx::query("SELECT entry_key FROM kv_entries ORDER BY entry_key")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| text_column(row, "entry_key"))
            .collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = retry("sql_keys_prefix", &RetryConfig::query(), || async {
            sqlx::query("SELECT entry_key FROM kv_entries WHERE entry_key LIKE ? ESCAPE '\\' ORDER BY entry_key")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| text_column(row, "entry_key"))
            .collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let row = retry("sql_usage", &RetryConfig::query(), || async {
            sqlx::query("SELECT COALESCE(SUM(size), 0) AS used FROM kv_entries")
                .fetch_one(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        let used: i64 = row.try_get("used").unwrap_or(0);
        Ok(StorageUsage {
            used: used.max(0) as u64,
            capacity: self.capacity,
        })
    }
}
