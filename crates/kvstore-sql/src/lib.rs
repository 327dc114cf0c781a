#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kvstore-sql** – Embedded-SQL storage driver for the kvstore
//! persistence kernel.
//!
//! One table per entity type, bootstrapped idempotently on every `open` so
//! a fresh process finds the schema intact even if the previous owner of
//! the database file crashed. `save` is an upsert: on an existing key,
//! `Version` always becomes `max(existing, incoming) + 1`; on a brand-new
//! key the caller's version is stored as-is. `UpdatedAt` always refreshes.

use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};

use kvstore_core::{Entity, Predicate, Store, StoreError, StoreResult};

/// Tunables for [`SqlBackend`].
#[derive(Clone, Debug)]
pub struct SqlConfig {
    /// Path to the database file. `:memory:` opens a private in-memory
    /// database.
    pub data_source: String,
    /// Create the database file if it doesn't exist.
    pub create_if_missing: bool,
    /// Table/index name prefix, defaults to `kv`.
    pub schema: String,
    /// Per-statement timeout.
    pub command_timeout: Duration,
}

impl SqlConfig {
    /// Configuration pointed at a file path or `:memory:`, with the
    /// documented defaults.
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            create_if_missing: true,
            schema: "kv".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// A SQLite-backed storage backend with versioned rows.
pub struct SqlBackend<T> {
    pool: SqlitePool,
    table: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> SqlBackend<T> {
    /// Open (bootstrapping the schema if absent) a backend for entity type
    /// `T`. The bootstrap sequence always runs, even against a database
    /// this process has opened before: no schema state is cached across a
    /// connection's open/close.
    pub async fn open(config: SqlConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(Path::new(&config.data_source))
            .create_if_missing(config.create_if_missing);
        // A single shared connection: sqlite's `:memory:` database is
        // private to the connection that created it, so a pool of more
        // than one would silently fragment state across callers.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let table = format!("{}_{}", config.schema, T::type_name());
        let backend = Self {
            pool,
            table,
            _marker: PhantomData,
        };
        backend.bootstrap_schema().await?;
        Ok(backend)
    }

    async fn bootstrap_schema(&self) -> StoreResult<()> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                Key       TEXT PRIMARY KEY NOT NULL,
                Data      TEXT NOT NULL,
                Version   INTEGER NOT NULL,
                ETag      TEXT NULL,
                CreatedAt TEXT NOT NULL,
                UpdatedAt TEXT NOT NULL
            )",
            table = self.table
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        for column in ["Version", "UpdatedAt"] {
            let index = format!(
                "CREATE INDEX IF NOT EXISTS IX_{table}_{column} ON {table}({column})",
                table = self.table,
                column = column
            );
            sqlx::query(&index)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.into()))?;
        }
        Ok(())
    }

    fn decode_row(&self, key: &str, data: &str) -> StoreResult<T> {
        serde_json::from_str(data).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            source: e.into(),
        })
    }
}

#[async_trait]
impl<T: Entity> Store<T> for SqlBackend<T> {
    async fn get(&self, key: &str) -> StoreResult<Option<T>> {
        let row = sqlx::query(&format!("SELECT Data FROM {} WHERE Key = ?", self.table))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let data: String = row.get("Data");
                Ok(Some(self.decode_row(key, &data)?))
            }
        }
    }

    async fn get_all(&self, predicate: Option<&Predicate<T>>) -> StoreResult<Vec<T>> {
        let rows = sqlx::query(&format!("SELECT Key, Data FROM {}", self.table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("Key");
            let data: String = row.get("Data");
            match self.decode_row(&key, &data) {
                Ok(value) => out.push(value),
                Err(e) => tracing::warn!(%key, error = %e, "skipping row that failed to decode"),
            }
        }
        Ok(out
            .into_iter()
            .filter(|v| predicate.map(|p| p.matches(v)).unwrap_or(true))
            .collect())
    }

    async fn save(&self, key: &str, mut entity: T) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let existing_version: Option<i64> = sqlx::query(&format!(
            "SELECT Version FROM {} WHERE Key = ?",
            self.table
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?
        .map(|row| row.get("Version"));

        let incoming_version = entity.version() as i64;
        let version = match existing_version {
            Some(existing) => existing.max(incoming_version) + 1,
            None => incoming_version,
        };
        entity.set_version(version as u64);

        let now = Utc::now().to_rfc3339();
        let data = serde_json::to_string(&entity).map_err(|e| StoreError::Backend(e.into()))?;
        let etag = entity.etag().map(|s| s.to_string());

        let upsert = format!(
            "INSERT INTO {table} (Key, Data, Version, ETag, CreatedAt, UpdatedAt)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(Key) DO UPDATE SET
                Data = excluded.Data,
                Version = excluded.Version,
                ETag = excluded.ETag,
                UpdatedAt = excluded.UpdatedAt",
            table = self.table
        );
        sqlx::query(&upsert)
            .bind(key)
            .bind(&data)
            .bind(version)
            .bind(&etag)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE Key = ?", self.table))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<usize> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result.rows_affected() as usize)
    }
}
