// Persisted credential storage

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tokio::sync::RwLock;

use super::types::{CredentialPair, REFRESH_TOKEN_KEY, TOKEN_KEY};

/// Key-value store holding the persisted credentials
///
/// Shared by every in-flight request; last write wins.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Read the stored credential pair, if both tokens are present
pub async fn load_pair(store: &dyn CredentialStore) -> Result<Option<CredentialPair>> {
    let access_token = store.get(TOKEN_KEY).await?;
    let refresh_token = store.get(REFRESH_TOKEN_KEY).await?;

    Ok(match (access_token, refresh_token) {
        (Some(access_token), Some(refresh_token)) => Some(CredentialPair {
            access_token,
            refresh_token,
        }),
        _ => None,
    })
}

/// Persist both tokens of a credential pair
pub async fn save_pair(store: &dyn CredentialStore, pair: &CredentialPair) -> Result<()> {
    store.set(TOKEN_KEY, &pair.access_token).await?;
    store.set(REFRESH_TOKEN_KEY, &pair.refresh_token).await?;
    Ok(())
}

/// Process-local store, lost on exit
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a credential pair
    pub fn with_pair(pair: &CredentialPair) -> Self {
        let mut entries = HashMap::new();
        entries.insert(TOKEN_KEY.to_string(), pair.access_token.clone());
        entries.insert(REFRESH_TOKEN_KEY.to_string(), pair.refresh_token.clone());
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// SQLite-backed store using an `auth_kv` table
///
/// Queries run inline on the calling task. The table holds two short rows
/// and every statement is a single-key lookup or write, so a call finishes
/// in microseconds and does not need a blocking thread. The connection lock
/// is never held across an await.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create credential directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        tracing::debug!("Opened credential store: {}", path.display());
        Self::from_connection(conn)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
        })
        .with_context(|| format!("Failed to read {} from SQLite", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                [key, value, updated_at.as_str()],
            )
        })
        .with_context(|| format!("Failed to write {} to SQLite", key))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM auth_kv", []))
            .context("Failed to clear credentials from SQLite")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> CredentialPair {
        CredentialPair {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_clear() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get(TOKEN_KEY).await.unwrap(), None);

        save_pair(&store, &pair()).await.unwrap();
        assert_eq!(load_pair(&store).await.unwrap(), Some(pair()));

        store.clear().await.unwrap();
        assert_eq!(store.get(TOKEN_KEY).await.unwrap(), None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_pair_requires_both_tokens() {
        let store = MemoryCredentialStore::new();
        store.set(TOKEN_KEY, "only-access").await.unwrap();
        assert_eq!(load_pair(&store).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_overwrites_and_clears() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();

        store.set(TOKEN_KEY, "first").await.unwrap();
        store.set(TOKEN_KEY, "second").await.unwrap();
        assert_eq!(store.get(TOKEN_KEY).await.unwrap().as_deref(), Some("second"));

        store.set(REFRESH_TOKEN_KEY, "refresh").await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.get(TOKEN_KEY).await.unwrap(), None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_keys_are_exact() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        save_pair(&store, &pair()).await.unwrap();

        let keys: Vec<String> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT key FROM auth_kv ORDER BY key")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(keys, vec!["REFRESH_TOKEN".to_string(), "TOKEN".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sqlite_store_shared_across_tasks() {
        let store = std::sync::Arc::new(SqliteCredentialStore::open_in_memory().unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let key = format!("KEY_{}", i);
                    store.set(&key, &format!("value-{}", i)).await.unwrap();
                    store.get(&key).await.unwrap()
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(format!("value-{}", i)));
        }
    }
}
