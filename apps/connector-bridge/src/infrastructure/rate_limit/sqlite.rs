//! SQLite-backed window store.
//!
//! Every instance pointing at the same database file shares one set of
//! windows. Each hit runs in an immediate transaction, so the prune, count
//! and insert for a key are atomic across processes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior, params};

use crate::application::ports::{WindowStore, WindowStoreError};
use crate::domain::rate_limit::{RateDecision, RateLimit, retry_after};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS rate_windows (
        key TEXT NOT NULL,
        ts INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_rate_windows_key_ts ON rate_windows(key, ts);
";

/// Window store in a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteWindowStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteWindowStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WindowStoreError::Unavailable`] if the file cannot be opened
    /// or the schema cannot be created.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, WindowStoreError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(busy_timeout).map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;

        tracing::info!(path = %path.display(), "Opened shared rate window store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Database file backing the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn hit_blocking(
        conn: &mut Connection,
        key: &str,
        limit: RateLimit,
        now_ms: u64,
    ) -> rusqlite::Result<RateDecision> {
        let window_ms = limit.window_ms();
        let now = to_sql(now_ms);
        let cutoff = to_sql(now_ms.saturating_sub(window_ms));

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM rate_windows WHERE key = ?1 AND ts <= ?2",
            params![key, cutoff],
        )?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM rate_windows WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;

        let max = i64::from(limit.limit);
        let decision = if count < max {
            tx.execute(
                "INSERT INTO rate_windows (key, ts) VALUES (?1, ?2)",
                params![key, now],
            )?;
            RateDecision::Allowed {
                remaining: u32::try_from(max - count - 1).unwrap_or(0),
            }
        } else {
            let entries = {
                let mut stmt =
                    tx.prepare("SELECT ts FROM rate_windows WHERE key = ?1 ORDER BY ts ASC")?;
                let rows = stmt.query_map(params![key], |row| row.get::<_, i64>(0))?;
                rows.map(|ts| ts.map(|t| u64::try_from(t).unwrap_or(0)))
                    .collect::<rusqlite::Result<VecDeque<u64>>>()?
            };
            RateDecision::Denied {
                retry_after: retry_after(&entries, now_ms, window_ms, limit.limit as usize),
            }
        };

        tx.commit()?;
        Ok(decision)
    }

    fn purge_blocking(conn: &Connection, cutoff_ms: u64) -> rusqlite::Result<usize> {
        conn.execute(
            "DELETE FROM rate_windows WHERE ts <= ?1",
            params![to_sql(cutoff_ms)],
        )
    }
}

#[async_trait]
impl WindowStore for SqliteWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: RateLimit,
        now_ms: u64,
    ) -> Result<RateDecision, WindowStoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            Self::hit_blocking(&mut conn, &key, limit, now_ms)
        })
        .await
        .map_err(|e| WindowStoreError::Unavailable(e.to_string()))?
        .map_err(unavailable)
    }

    async fn purge(&self, now_ms: u64, max_window: Duration) -> Result<usize, WindowStoreError> {
        let conn = Arc::clone(&self.conn);
        let window_ms = u64::try_from(max_window.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);
        tokio::task::spawn_blocking(move || Self::purge_blocking(&conn.lock(), cutoff))
            .await
            .map_err(|e| WindowStoreError::Unavailable(e.to_string()))?
            .map_err(unavailable)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

fn unavailable(err: rusqlite::Error) -> WindowStoreError {
    WindowStoreError::Unavailable(err.to_string())
}

fn to_sql(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}
