use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::Mutex;
use tracing::info;

/// Key under which the provider persists its current grant.
pub const DEFAULT_SESSION_KEY: &str = "csaas.auth.session";

#[derive(Debug, Clone)]
pub struct StoredSession {
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

/// Durable home for a serialized session grant.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<StoredSession>>;
    async fn save(&self, key: &str, payload: &str) -> Result<()>;
    /// Returns whether a grant was present.
    async fn clear(&self, key: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A single connection keeps `sqlite::memory:` pointing at one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session database '{database_url}'"))?;
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
}

#[async_trait]
impl SessionStore for Storage {
    async fn load(&self, key: &str) -> Result<Option<StoredSession>> {
        let row = sqlx::query("SELECT payload, updated_at FROM auth_sessions WHERE storage_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load session '{key}'"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.try_get("payload")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(StoredSession {
            payload,
            updated_at: parse_sqlite_timestamp(&updated_at)?,
        }))
    }

    async fn save(&self, key: &str, payload: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_sessions (storage_key, payload, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(storage_key) DO UPDATE SET payload = excluded.payload, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(payload)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist session '{key}'"))?;
        info!(storage_key = key, "session-store: grant persisted");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE storage_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear session '{key}'"))?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(storage_key = key, "session-store: grant cleared");
        }
        Ok(removed)
    }
}

/// Non-durable store for ephemeral runs and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<String, StoredSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<StoredSession>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, payload: &str) -> Result<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            StoredSession {
                payload: payload.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}

fn parse_sqlite_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("invalid sqlite timestamp '{raw}'"))?;
    Ok(naive.and_utc())
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
