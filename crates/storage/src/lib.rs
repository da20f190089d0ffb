use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

/// A serialized cache snapshot as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub key: String,
    pub schema_version: i64,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

/// Key/value persistence for cache snapshots. The engine owns the snapshot
/// format; implementations only store opaque bodies.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<StoredSnapshot>>;
    async fn save(&self, key: &str, schema_version: i64, body: &str) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
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

    pub async fn list_snapshot_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT snapshot_key FROM cache_snapshots ORDER BY snapshot_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }
}

#[async_trait]
impl SnapshotStore for Storage {
    async fn load(&self, key: &str) -> Result<Option<StoredSnapshot>> {
        let row = sqlx::query(
            "SELECT snapshot_key, schema_version, body, updated_at
             FROM cache_snapshots WHERE snapshot_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load snapshot '{key}'"))?;

        Ok(row.map(|r| StoredSnapshot {
            key: r.get::<String, _>(0),
            schema_version: r.get::<i64, _>(1),
            body: r.get::<String, _>(2),
            updated_at: r.get::<DateTime<Utc>, _>(3),
        }))
    }

    async fn save(&self, key: &str, schema_version: i64, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_snapshots (snapshot_key, schema_version, body, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(snapshot_key) DO UPDATE SET
                schema_version=excluded.schema_version,
                body=excluded.body,
                updated_at=excluded.updated_at",
        )
        .bind(key)
        .bind(schema_version)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save snapshot '{key}'"))?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_snapshots WHERE snapshot_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear snapshot '{key}'"))?;
        Ok(())
    }
}

/// Process-local snapshot store, used when no database path is configured.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, StoredSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<StoredSnapshot>> {
        Ok(self.snapshots.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, schema_version: i64, body: &str) -> Result<()> {
        self.snapshots.lock().insert(
            key.to_string(),
            StoredSnapshot {
                key: key.to_string(),
                schema_version,
                body: body.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.snapshots.lock().remove(key);
        Ok(())
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
