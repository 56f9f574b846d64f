/// SQLite-backed TTL store.
///
/// Rows carry an absolute `expires_at` (unix millis). Reads filter on it;
/// expired rows are deleted opportunistically on write and by
/// `purge_expired`.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use labvm_core::{KvStore, LabVmError, LabVmResult};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
         key        TEXT PRIMARY KEY,
         value      TEXT NOT NULL,
         expires_at INTEGER NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);";

pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite registry database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize kv schema")?;

        info!("SqliteKvStore opened at {:?}", path.as_ref());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn purge_expired(&self) -> LabVmResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM kv WHERE expires_at <= ?1", params![now_millis()])
            .map_err(unavailable)?;
        if removed > 0 {
            debug!(removed, "Purged expired registry rows");
        }
        Ok(removed)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn unavailable(e: rusqlite::Error) -> LabVmError {
    LabVmError::RegistryUnavailable(format!("sqlite: {e}"))
}

/// `LIKE` treats `%` and `_` as wildcards; escape them for prefix scans.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> LabVmResult<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
            params![key, now_millis()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(unavailable)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> LabVmResult<()> {
        let now = now_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )
        .map_err(unavailable)?;
        conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now])
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> LabVmResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
            )
            .map_err(unavailable)?;
        // Clear an expired leftover too, it just doesn't count.
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> LabVmResult<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv
                 WHERE key LIKE ?1 ESCAPE '\\' AND expires_at > ?2
                 ORDER BY key",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![like_prefix(prefix), now_millis()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;
        Ok(rows)
    }
}
