//! Sentinel-row lock with heartbeat.
//!
//! The lock is a single row (`id = 1`) in a side table. Whoever inserts it
//! owns the lock. The owner refreshes `heartbeat_at` in the background; a
//! row whose heartbeat is older than the lock timeout belongs to a dead
//! process and is deleted by the next contender.

use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sluice_migrate::{LockConfig, LockPrimitive, MigrateResult};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SqliteError, SqliteResult, is_busy};

struct Heartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Cross-process lock stored in the migrated database.
pub struct SqliteLock {
    conn: Connection,
    table: String,
    owner: String,
    lock_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl SqliteLock {
    /// Create a lock backed by `table`.
    pub fn new(conn: Connection, table: impl Into<String>, config: &LockConfig) -> Self {
        Self {
            conn,
            table: table.into(),
            owner: Uuid::new_v4().to_string(),
            lock_timeout: config.lock_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat: Mutex::new(None),
        }
    }

    /// Token identifying this lock instance as the owner.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Create the lock table if needed.
    pub async fn create(&self) -> SqliteResult<()> {
        let sql = create_sql(&self.table);
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Current owner token, if the lock is held.
    pub async fn holder(&self) -> SqliteResult<Option<String>> {
        let sql = format!("SELECT owner FROM {} WHERE id = 1", self.table);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(SqliteError::from)
    }

    fn start_heartbeat(&self) {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let conn = self.conn.clone();
        let sql = format!("UPDATE {} SET heartbeat_at = ?1 WHERE id = 1 AND owner = ?2", self.table);
        let owner = self.owner.clone();
        let interval = self.heartbeat_interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let sql = sql.clone();
                let owner = owner.clone();
                let refreshed = conn
                    .call(move |conn| Ok(conn.execute(&sql, rusqlite::params![now_ms(), owner])?))
                    .await;
                match refreshed {
                    Ok(0) => {
                        warn!("Schema history lock was taken over while held");
                        break;
                    }
                    Ok(_) => debug!("Refreshed schema history lock heartbeat"),
                    Err(e) => warn!(error = %e, "Failed to refresh schema history lock heartbeat"),
                }
            }
        });

        if let Some(previous) = self.heartbeat.lock().replace(Heartbeat { stop, task }) {
            previous.stop.cancel();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop.cancel();
            heartbeat.task.abort();
        }
    }
}

fn create_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER NOT NULL PRIMARY KEY CHECK (id = 1),
            owner TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        );"
    )
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait::async_trait]
impl LockPrimitive for SqliteLock {
    async fn try_acquire(&self) -> MigrateResult<bool> {
        let create = create_sql(&self.table);
        let expire = format!("DELETE FROM {} WHERE heartbeat_at < ?1", self.table);
        let insert = format!(
            "INSERT OR IGNORE INTO {} (id, owner, acquired_at, heartbeat_at) VALUES (1, ?1, ?2, ?2)",
            self.table
        );
        let owner = self.owner.clone();
        let timeout_ms = i64::try_from(self.lock_timeout.as_millis()).unwrap_or(i64::MAX);

        let (expired, acquired) = self
            .conn
            .call(move |conn| {
                let attempt = (|| -> rusqlite::Result<(usize, bool)> {
                    conn.execute_batch(&create)?;
                    let now = now_ms();
                    let expired = conn.execute(&expire, [now.saturating_sub(timeout_ms)])?;
                    let inserted = conn.execute(&insert, rusqlite::params![owner, now])?;
                    Ok((expired, inserted == 1))
                })();
                match attempt {
                    Err(e) if is_busy(&e) => Ok((0, false)),
                    other => Ok(other?),
                }
            })
            .await
            .map_err(SqliteError::from)?;

        if expired > 0 {
            info!(table = %self.table, "Removed expired schema history lock");
        }
        if acquired {
            debug!(owner = %self.owner, "Acquired SQLite lock");
            self.start_heartbeat();
        }
        Ok(acquired)
    }

    async fn release(&self) -> MigrateResult<()> {
        self.stop_heartbeat();
        let sql = format!("DELETE FROM {} WHERE id = 1 AND owner = ?1", self.table);
        let owner = self.owner.clone();
        let (rolled_back, deleted) = self
            .conn
            .call(move |conn| {
                // A run dropped mid-migration leaves its transaction open.
                let rolled_back = !conn.is_autocommit();
                if rolled_back {
                    conn.execute_batch("ROLLBACK")?;
                }
                Ok((rolled_back, conn.execute(&sql, [owner])?))
            })
            .await
            .map_err(SqliteError::from)?;
        if rolled_back {
            warn!(owner = %self.owner, "Rolled back an abandoned migration transaction");
        }
        if deleted == 0 {
            warn!(owner = %self.owner, "Schema history lock was no longer held at release");
        }
        Ok(())
    }
}

impl Drop for SqliteLock {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
