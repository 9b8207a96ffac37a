//! Device-local key-value persistence for the client cache.
//!
//! `Storage` keeps entries in sqlite so they survive restarts; `MemoryStore`
//! holds them for the lifetime of the process only.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

/// One persisted cache record. The value is opaque JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub value_json: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_ms: i64,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>>;
    async fn save(&self, entry: &StoredEntry) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
    async fn remove_prefix(&self, prefix: &str) -> Result<u64>;
    async fn entries(&self) -> Result<Vec<StoredEntry>>;
    async fn clear(&self) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn save(&self, entry: &StoredEntry) -> Result<()> {
        self.entries.lock().insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let mut guard = self.entries.lock();
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok((before - guard.len()) as u64)
    }

    async fn entries(&self) -> Result<Vec<StoredEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    async fn clear(&self) -> Result<u64> {
        let mut guard = self.entries.lock();
        let removed = guard.len() as u64;
        guard.clear();
        Ok(removed)
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid cache database url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open cache database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate cache database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for Storage {
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>> {
        let row = sqlx::query(
            "SELECT cache_key, value_json, fetched_at_ms, ttl_ms
             FROM cache_entries WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load cache entry '{key}'"))?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    async fn save(&self, entry: &StoredEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_entries (cache_key, value_json, fetched_at_ms, ttl_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                value_json = excluded.value_json,
                fetched_at_ms = excluded.fetched_at_ms,
                ttl_ms = excluded.ttl_ms",
        )
        .bind(&entry.key)
        .bind(&entry.value_json)
        .bind(entry.fetched_at.timestamp_millis())
        .bind(entry.ttl_ms)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save cache entry '{}'", entry.key))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove cache entry '{key}'"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        // substr comparison instead of LIKE so '_' and '%' in keys stay literal.
        let result =
            sqlx::query("DELETE FROM cache_entries WHERE substr(cache_key, 1, length(?)) = ?")
                .bind(prefix)
                .bind(prefix)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to remove cache entries with prefix '{prefix}'"))?;
        Ok(result.rows_affected())
    }

    async fn entries(&self) -> Result<Vec<StoredEntry>> {
        let rows = sqlx::query(
            "SELECT cache_key, value_json, fetched_at_ms, ttl_ms
             FROM cache_entries ORDER BY cache_key",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list cache entries")?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .context("failed to clear cache entries")?;
        Ok(result.rows_affected())
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEntry> {
    let key: String = row.try_get("cache_key")?;
    let fetched_at_ms: i64 = row.try_get("fetched_at_ms")?;
    let fetched_at = DateTime::<Utc>::from_timestamp_millis(fetched_at_ms)
        .ok_or_else(|| anyhow!("cache entry '{key}' has invalid timestamp {fetched_at_ms}"))?;
    Ok(StoredEntry {
        value_json: row.try_get("value_json")?,
        ttl_ms: row.try_get("ttl_ms")?,
        fetched_at,
        key,
    })
}

/// Creates the directory holding a file-backed sqlite database.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
