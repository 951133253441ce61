//! Key-value session storage.
//!
//! The manager persists one opaque serialized record per image key. Records
//! are grouped by a shard-scoped namespace so that one synchronization pass
//! can enumerate everything a single shard owns. Two implementations are
//! provided: [`SqliteStorage`] for durable deployments and [`MemoryStorage`]
//! for tests and ephemeral use.
//!
//! Values are opaque strings everywhere except [`KeyValueStorage::update`],
//! which owns the reconciliation merge: it decodes just enough of a stored
//! payload to match session ids against the remote shard's live listing and
//! removes records the shard no longer recognizes.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result, StorageError};
use crate::session::{RemoteSession, TileServerShard};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable map from image key to an opaque serialized session record.
///
/// Keys are globally unique (an image identity maps to at most one record);
/// the namespace supplied on `set` fixes which shard's enumeration scope the
/// record belongs to.
pub trait KeyValueStorage: Send + Sync {
    /// Read the record stored under `key`, if any.
    fn get(&self, key: &str) -> StorageFuture<'_, Option<String>>;

    /// Unconditionally write `value` under `key` in `namespace`,
    /// overwriting any previous record (and its namespace).
    fn set(&self, namespace: &str, key: &str, value: &str) -> StorageFuture<'_, ()>;

    /// Delete the record under `key`. Deleting an absent key is a no-op.
    fn delete(&self, key: &str) -> StorageFuture<'_, ()>;

    /// All keys stored under `namespace`, ordered by key.
    fn get_all_keys(&self, namespace: &str) -> StorageFuture<'_, Vec<String>>;

    /// All `(key, value)` pairs stored under `namespace`, ordered by key.
    fn get_all_key_values(
        &self,
        namespace: &str,
    ) -> StorageFuture<'_, Vec<(String, String)>>;

    /// Reconcile `namespace` against the shard's authoritative live-session
    /// listing: records whose session id the remote no longer recognizes are
    /// removed, as are records that cannot be decoded (they could never be
    /// matched or evicted by recency). Returns the number removed.
    fn update(
        &self,
        namespace: &str,
        remote_truth: &[RemoteSession],
        shard: &TileServerShard,
    ) -> StorageFuture<'_, usize>;
}

/// Shared storage handle.
pub type StorageHandle = Arc<dyn KeyValueStorage>;

/// Pull the session id out of a stored payload without fully decoding it.
fn extract_session_id(value: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(value)
        .ok()?
        .get("imageSessionId")?
        .as_str()
        .map(String::from)
}

fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// =============================================================================
// SQLite implementation
// =============================================================================

/// Schema for the session table.
///
/// `session_id` is denormalized out of the payload at write time so the
/// reconciliation delete can run as a single statement.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS image_sessions (
    key        TEXT PRIMARY KEY,
    namespace  TEXT NOT NULL,
    session_id TEXT,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_image_sessions_namespace
    ON image_sessions(namespace);
";

/// SQLite-backed storage.
///
/// All statement execution runs on the blocking pool; the connection is
/// shared behind a mutex, which is sufficient for the short single-statement
/// operations this store issues.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        Self::prepare(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(StorageError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_blocking<T, F>(&self, op: F) -> StorageFuture<'static, T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                op(&guard).map_err(StorageError::from)
            })
            .await
            .map_err(|err| StorageError::TaskJoin(err.to_string()))?
            .map_err(Error::from)
        })
    }
}

impl KeyValueStorage for SqliteStorage {
    fn get(&self, key: &str) -> StorageFuture<'_, Option<String>> {
        let key = key.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT value FROM image_sessions WHERE key = ?1",
                [&key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> StorageFuture<'_, ()> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let value = value.to_string();
        let session_id = extract_session_id(&value);
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO image_sessions (key, namespace, session_id, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                     namespace = excluded.namespace,
                     session_id = excluded.session_id,
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                rusqlite::params![key, namespace, session_id, value, epoch_ms()],
            )?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM image_sessions WHERE key = ?1", [&key])?;
            Ok(())
        })
    }

    fn get_all_keys(&self, namespace: &str) -> StorageFuture<'_, Vec<String>> {
        let namespace = namespace.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM image_sessions WHERE namespace = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map([&namespace], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
    }

    fn get_all_key_values(
        &self,
        namespace: &str,
    ) -> StorageFuture<'_, Vec<(String, String)>> {
        let namespace = namespace.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM image_sessions WHERE namespace = ?1 ORDER BY key",
            )?;
            let pairs = stmt
                .query_map([&namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            Ok(pairs)
        })
    }

    fn update(
        &self,
        namespace: &str,
        remote_truth: &[RemoteSession],
        shard: &TileServerShard,
    ) -> StorageFuture<'_, usize> {
        let namespace = namespace.to_string();
        let shard_label = shard.label.clone();
        let live: Vec<String> = remote_truth
            .iter()
            .map(|session| session.image_session_id.clone())
            .collect();
        self.run_blocking(move |conn| {
            let removed = if live.is_empty() {
                conn.execute(
                    "DELETE FROM image_sessions WHERE namespace = ?1",
                    [&namespace],
                )?
            } else {
                let placeholders = (2..=live.len() + 1)
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "DELETE FROM image_sessions
                     WHERE namespace = ?1
                     AND (session_id IS NULL OR session_id NOT IN ({placeholders}))"
                );
                let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(live.len() + 1);
                params.push(&namespace);
                for id in &live {
                    params.push(id);
                }
                conn.execute(&sql, params.as_slice())?
            };
            if removed > 0 {
                debug!(
                    namespace = %namespace,
                    shard = %shard_label,
                    removed,
                    "reconciled stale session records"
                );
            }
            Ok(removed)
        })
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug, Clone)]
struct StoredEntry {
    namespace: String,
    value: String,
}

/// In-memory storage for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move {
            Ok(self
                .entries
                .read()
                .await
                .get(&key)
                .map(|entry| entry.value.clone()))
        })
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> StorageFuture<'_, ()> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.entries
                .write()
                .await
                .insert(key, StoredEntry { namespace, value });
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.remove(&key);
            Ok(())
        })
    }

    fn get_all_keys(&self, namespace: &str) -> StorageFuture<'_, Vec<String>> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            let entries = self.entries.read().await;
            let mut keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.namespace == namespace)
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort_unstable();
            Ok(keys)
        })
    }

    fn get_all_key_values(
        &self,
        namespace: &str,
    ) -> StorageFuture<'_, Vec<(String, String)>> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            let entries = self.entries.read().await;
            let mut pairs: Vec<(String, String)> = entries
                .iter()
                .filter(|(_, entry)| entry.namespace == namespace)
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect();
            pairs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            Ok(pairs)
        })
    }

    fn update(
        &self,
        namespace: &str,
        remote_truth: &[RemoteSession],
        shard: &TileServerShard,
    ) -> StorageFuture<'_, usize> {
        let namespace = namespace.to_string();
        let shard_label = shard.label.clone();
        let live: std::collections::HashSet<String> = remote_truth
            .iter()
            .map(|session| session.image_session_id.clone())
            .collect();
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| {
                if entry.namespace != namespace {
                    return true;
                }
                extract_session_id(&entry.value)
                    .is_some_and(|id| live.contains(&id))
            });
            let removed = before - entries.len();
            if removed > 0 {
                debug!(
                    namespace = %namespace,
                    shard = %shard_label,
                    removed,
                    "reconciled stale session records"
                );
            }
            Ok(removed)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionData, ShardId};
    use chrono::{TimeZone, Utc};

    fn shard() -> TileServerShard {
        TileServerShard::new(ShardId(0), "tiles-a", "http://tiles-a.internal:9090")
    }

    fn record(session_id: &str) -> String {
        SessionData::with_timestamp(
            session_id,
            shard(),
            vec![],
            Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap(),
        )
        .encode()
        .unwrap()
    }

    async fn exercise_crud(storage: &dyn KeyValueStorage) {
        let ns = shard().namespace();

        assert_eq!(storage.get("slides/a.svs").await.unwrap(), None);

        storage.set(&ns, "slides/a.svs", &record("sess-a")).await.unwrap();
        let stored = storage.get("slides/a.svs").await.unwrap().unwrap();
        assert_eq!(stored, record("sess-a"));

        // Overwrite: last writer wins
        storage.set(&ns, "slides/a.svs", &record("sess-a2")).await.unwrap();
        let stored = storage.get("slides/a.svs").await.unwrap().unwrap();
        assert_eq!(stored, record("sess-a2"));

        storage.set(&ns, "slides/b.svs", &record("sess-b")).await.unwrap();
        assert_eq!(
            storage.get_all_keys(&ns).await.unwrap(),
            vec!["slides/a.svs".to_string(), "slides/b.svs".to_string()]
        );
        let pairs = storage.get_all_key_values(&ns).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "slides/a.svs");

        // Other namespaces are not visible
        assert!(storage.get_all_keys("shard-9").await.unwrap().is_empty());

        // Idempotent delete
        storage.delete("slides/a.svs").await.unwrap();
        storage.delete("slides/a.svs").await.unwrap();
        assert_eq!(storage.get("slides/a.svs").await.unwrap(), None);
        assert_eq!(storage.get_all_keys(&ns).await.unwrap().len(), 1);
    }

    async fn exercise_update(storage: &dyn KeyValueStorage) {
        let ns = shard().namespace();

        storage.set(&ns, "slides/a.svs", &record("sess-a")).await.unwrap();
        storage.set(&ns, "slides/b.svs", &record("sess-b")).await.unwrap();
        storage.set(&ns, "slides/c.svs", &record("sess-c")).await.unwrap();
        // Undecodable record: can never be matched, reconciled away
        storage.set(&ns, "slides/junk.svs", "{broken").await.unwrap();
        // A record on another shard's namespace is untouched
        storage.set("shard-9", "slides/z.svs", &record("sess-z")).await.unwrap();

        let remote = vec![RemoteSession::new("sess-a"), RemoteSession::new("sess-c")];
        let removed = storage.update(&ns, &remote, &shard()).await.unwrap();
        assert_eq!(removed, 2); // sess-b and the junk record

        assert_eq!(
            storage.get_all_keys(&ns).await.unwrap(),
            vec!["slides/a.svs".to_string(), "slides/c.svs".to_string()]
        );
        assert!(storage.get("slides/z.svs").await.unwrap().is_some());

        // Empty remote truth clears the namespace
        let removed = storage.update(&ns, &[], &shard()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(storage.get_all_keys(&ns).await.unwrap().is_empty());
        assert!(storage.get("slides/z.svs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_crud() {
        exercise_crud(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn memory_update_reconciles() {
        exercise_update(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn sqlite_crud() {
        exercise_crud(&SqliteStorage::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_update_reconciles() {
        exercise_update(&SqliteStorage::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .set(&shard().namespace(), "slides/a.svs", &record("sess-a"))
                .await
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            storage.get("slides/a.svs").await.unwrap().unwrap(),
            record("sess-a")
        );
    }

    #[test]
    fn extract_session_id_is_defensive() {
        assert_eq!(
            extract_session_id(r#"{"imageSessionId": "sess-1"}"#),
            Some("sess-1".to_string())
        );
        assert_eq!(extract_session_id(r#"{"imageSessionId": 7}"#), None);
        assert_eq!(extract_session_id("{broken"), None);
        assert_eq!(extract_session_id("{}"), None);
    }

    #[tokio::test]
    async fn set_moves_key_between_namespaces() {
        let storage = MemoryStorage::new();
        storage.set("shard-0", "slides/a.svs", &record("sess-a")).await.unwrap();
        storage.set("shard-1", "slides/a.svs", &record("sess-a2")).await.unwrap();

        assert!(storage.get_all_keys("shard-0").await.unwrap().is_empty());
        assert_eq!(storage.get_all_keys("shard-1").await.unwrap().len(), 1);
    }
}
