//! SQLite-backed durable store.
//! One row per content hash (serialized entry JSON) plus a settings table for
//! scalar user preferences. Batches are applied inside one transaction.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::{DurableStore, Snapshot, StoreError, WriteBatch};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Unavailable(format!("failed to open SQLite store: {e}")))?;
        let store = Self::init(conn)?;
        info!(path = %db_path.display(), "SQLite content store opened");
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Query(format!("PRAGMA failed: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_cache (
                content_hash TEXT PRIMARY KEY,
                entry TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| StoreError::Query(format!("create tables failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl DurableStore for SqliteStore {
    fn load(&self) -> Result<Snapshot, StoreError> {
        let conn = self.conn.lock();
        let mut snapshot = Snapshot::default();

        let mut stmt = conn
            .prepare("SELECT content_hash, entry FROM translation_cache")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| StoreError::Query(e.to_string()))?;
        for row in rows {
            snapshot
                .entries
                .push(row.map_err(|e| StoreError::Query(e.to_string()))?);
        }

        let mut stmt = conn
            .prepare("SELECT name, value FROM settings")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| StoreError::Query(e.to_string()))?;
        for row in rows {
            snapshot
                .settings
                .push(row.map_err(|e| StoreError::Query(e.to_string()))?);
        }

        debug!(
            entries = snapshot.entries.len(),
            settings = snapshot.settings.len(),
            "SQLite store loaded"
        );
        Ok(snapshot)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let now = now_unix();
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Query(format!("begin failed: {e}")))?;
        {
            let mut delete = tx
                .prepare_cached("DELETE FROM translation_cache WHERE content_hash = ?1")
                .map_err(|e| StoreError::Query(e.to_string()))?;
            for key in &batch.deletes {
                delete
                    .execute(params![key])
                    .map_err(|e| StoreError::Query(e.to_string()))?;
            }

            let mut put = tx
                .prepare_cached(
                    "INSERT OR REPLACE INTO translation_cache (content_hash, entry, updated_at)
                     VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| StoreError::Query(e.to_string()))?;
            for (key, entry) in &batch.puts {
                put.execute(params![key, entry, now])
                    .map_err(|e| StoreError::Query(e.to_string()))?;
            }

            let mut setting = tx
                .prepare_cached("INSERT OR REPLACE INTO settings (name, value) VALUES (?1, ?2)")
                .map_err(|e| StoreError::Query(e.to_string()))?;
            for (name, value) in &batch.settings {
                setting
                    .execute(params![name, value])
                    .map_err(|e| StoreError::Query(e.to_string()))?;
            }
        }
        tx.commit()
            .map_err(|e| StoreError::Query(format!("commit failed: {e}")))
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
