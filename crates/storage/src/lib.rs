use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chat_driver::{SessionStore, SessionStoreConnector};
use chrono::{DateTime, Utc};
use shared::domain::{Contact, SessionId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use tracing::{debug, info};

mod contact_file;

pub use contact_file::{JsonContactFile, DEFAULT_CONTACTS_FILE};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Persistence for the last captured list of recipient contacts.
#[async_trait]
pub trait ContactSnapshotStore: Send + Sync {
    async fn save_contacts(&self, contacts: &[Contact]) -> Result<()>;
    /// Returns an empty list when nothing has been saved yet.
    async fn load_contacts(&self) -> Result<Vec<Contact>>;
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty schema.
        let max_connections = if is_in_memory(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session store '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(%database_url, "storage: sqlite pool ready");
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn load_session_blob(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>> {
        let blob = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT blob FROM session_credentials WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load session '{session_id}'"))?;
        Ok(blob)
    }

    pub async fn save_session_blob(&self, session_id: &SessionId, blob: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_credentials (session_id, blob, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
        )
        .bind(session_id.as_str())
        .bind(blob)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save session '{session_id}'"))?;
        Ok(())
    }

    pub async fn delete_session_blob(&self, session_id: &SessionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_credentials WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete session '{session_id}'"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn session_saved_at(&self, session_id: &SessionId) -> Result<Option<DateTime<Utc>>> {
        let saved_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT updated_at FROM session_credentials WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(saved_at)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT session_id FROM session_credentials ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(SessionId).collect())
    }

    pub async fn replace_contact_snapshot(&self, contacts: &[Contact]) -> Result<()> {
        let saved_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM contact_snapshots")
            .execute(&mut *tx)
            .await?;
        for (position, contact) in contacts.iter().enumerate() {
            let contact_json = serde_json::to_string(contact)?;
            sqlx::query(
                "INSERT INTO contact_snapshots (position, contact_json, saved_at) VALUES (?, ?, ?)",
            )
            .bind(i64::try_from(position)?)
            .bind(contact_json)
            .bind(saved_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.context("failed to commit contact snapshot")?;
        info!(count = contacts.len(), "storage: contact snapshot replaced");
        Ok(())
    }

    pub async fn contact_snapshot(&self) -> Result<Vec<Contact>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT contact_json FROM contact_snapshots ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|raw| serde_json::from_str(raw).context("corrupt contact snapshot row"))
            .collect()
    }
}

#[async_trait]
impl ContactSnapshotStore for Storage {
    async fn save_contacts(&self, contacts: &[Contact]) -> Result<()> {
        self.replace_contact_snapshot(contacts).await
    }

    async fn load_contacts(&self) -> Result<Vec<Contact>> {
        self.contact_snapshot().await
    }
}

#[async_trait]
impl SessionStore for Storage {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>> {
        self.load_session_blob(session_id).await
    }

    async fn save(&self, session_id: &SessionId, blob: &[u8]) -> Result<()> {
        self.save_session_blob(session_id, blob).await
    }

    async fn delete(&self, session_id: &SessionId) -> Result<()> {
        self.delete_session_blob(session_id).await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.close().await;
        Ok(())
    }
}

/// Opens a fresh SQLite pool per operation; the pool is closed again through
/// [`SessionStore::disconnect`].
pub struct SqliteSessionStoreConnector;

#[async_trait]
impl SessionStoreConnector for SqliteSessionStoreConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn SessionStore>> {
        let storage = Storage::new(uri).await?;
        Ok(Arc::new(storage))
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
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
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
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
