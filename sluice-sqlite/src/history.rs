//! Schema history table stored in SQLite.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sluice_migrate::{
    AppliedMigration, AppliedMigrationDraft, LockConfig, LockPrimitive, MigrateResult, MigrationType,
    SchemaHistory, Version,
};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::connection::SqliteDatabase;
use crate::error::{SqliteError, SqliteResult};
use crate::lock::SqliteLock;

const COLUMNS: &str = "installed_rank, version, description, type, script, checksum, \
                       installed_by, installed_on, execution_time, success";

/// A history row as stored.
struct RawRow {
    installed_rank: i32,
    version: Option<String>,
    description: String,
    migration_type: String,
    script: String,
    checksum: Option<i32>,
    installed_by: String,
    installed_on: String,
    execution_time: i64,
    success: bool,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            installed_rank: row.get(0)?,
            version: row.get(1)?,
            description: row.get(2)?,
            migration_type: row.get(3)?,
            script: row.get(4)?,
            checksum: row.get(5)?,
            installed_by: row.get(6)?,
            installed_on: row.get(7)?,
            execution_time: row.get(8)?,
            success: row.get(9)?,
        })
    }

    fn decode(self) -> SqliteResult<AppliedMigration> {
        let rank = self.installed_rank;
        let version = self
            .version
            .as_deref()
            .map(Version::parse)
            .transpose()
            .map_err(|e| SqliteError::invalid_row(rank, e.to_string()))?;
        let migration_type =
            MigrationType::from_name(&self.migration_type).map_err(|e| SqliteError::invalid_row(rank, e.to_string()))?;
        let installed_on = DateTime::parse_from_rfc3339(&self.installed_on)
            .map_err(|e| SqliteError::invalid_row(rank, format!("installed_on: {e}")))?
            .with_timezone(&Utc);

        Ok(AppliedMigration {
            installed_rank: rank,
            version,
            description: self.description,
            migration_type,
            script: self.script,
            checksum: self.checksum,
            installed_by: self.installed_by,
            installed_on,
            execution_time_ms: self.execution_time,
            success: self.success,
        })
    }
}

/// Schema history kept in a table of the migrated database.
///
/// Rows are written on the same connection migrations run on, so inside a
/// migration transaction the row commits or rolls back with the script.
pub struct SqliteSchemaHistory {
    conn: Connection,
    table: String,
    lock: Arc<SqliteLock>,
}

impl SqliteSchemaHistory {
    /// History in `db`, using the table named by its configuration.
    pub fn new(db: &SqliteDatabase, lock: &LockConfig) -> Self {
        let config = db.config();
        Self {
            conn: db.connection().clone(),
            table: config.history_table.clone(),
            lock: Arc::new(SqliteLock::new(db.connection().clone(), config.lock_table(), lock)),
        }
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The lock guarding this history.
    pub fn lock(&self) -> &Arc<SqliteLock> {
        &self.lock
    }

    async fn rows(&self, filter: &'static str) -> SqliteResult<Vec<RawRow>> {
        let sql = format!("SELECT {COLUMNS} FROM {} {filter} ORDER BY installed_rank", self.table);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], RawRow::read)?;
                let results: Result<Vec<_>, _> = rows.collect();
                Ok(results?)
            })
            .await
            .map_err(SqliteError::from)
    }
}

fn decode_all(rows: Vec<RawRow>) -> SqliteResult<Vec<AppliedMigration>> {
    rows.into_iter().map(RawRow::decode).collect()
}

#[async_trait::async_trait]
impl SchemaHistory for SqliteSchemaHistory {
    fn name(&self) -> &str {
        &self.table
    }

    async fn exists(&self) -> MigrateResult<bool> {
        let table = self.table.clone();
        let count: i64 = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )?)
            })
            .await
            .map_err(SqliteError::from)?;
        Ok(count > 0)
    }

    async fn create(&self) -> MigrateResult<()> {
        let table = self.table.clone();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                installed_rank INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT,
                description TEXT NOT NULL,
                type TEXT NOT NULL,
                script TEXT NOT NULL,
                checksum INTEGER,
                installed_by TEXT NOT NULL,
                installed_on TEXT NOT NULL,
                execution_time INTEGER NOT NULL,
                success INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_s_idx ON {table} (success);"
        );
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)?;
        self.lock.create().await?;
        info!(table = %self.table, "Created schema history table");
        Ok(())
    }

    async fn all_applied(&self) -> MigrateResult<Vec<AppliedMigration>> {
        Ok(decode_all(self.rows("").await?)?)
    }

    async fn record(&self, draft: AppliedMigrationDraft) -> MigrateResult<AppliedMigration> {
        let installed_on = Utc::now();
        let insert = format!(
            "INSERT INTO {table} (version, description, type, script, checksum, \
             installed_by, installed_on, execution_time, success) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            table = self.table
        );
        let row = draft.clone();
        let stamp = installed_on.to_rfc3339();

        let rank: i32 = self
            .conn
            .call(move |conn| {
                conn.execute(
                    &insert,
                    rusqlite::params![
                        row.version.as_ref().map(|v| v.as_str().to_string()),
                        row.description,
                        row.migration_type.as_str(),
                        row.script,
                        row.checksum,
                        row.installed_by,
                        stamp,
                        row.execution_time_ms,
                        row.success,
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(i32::try_from(id).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, id))?)
            })
            .await
            .map_err(SqliteError::from)?;

        debug!(rank, success = draft.success, "Recorded schema history row");
        Ok(draft.into_applied(rank, installed_on))
    }

    async fn remove_failed(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let failed = decode_all(self.rows("WHERE success = 0").await?)?;
        if failed.is_empty() {
            return Ok(failed);
        }
        let sql = format!("DELETE FROM {} WHERE success = 0", self.table);
        self.conn
            .call(move |conn| {
                conn.execute(&sql, [])?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)?;
        Ok(failed)
    }

    async fn update_checksum_and_description(
        &self,
        installed_rank: i32,
        checksum: Option<i32>,
        description: &str,
        migration_type: MigrationType,
    ) -> MigrateResult<()> {
        let sql = format!(
            "UPDATE {} SET checksum = ?1, description = ?2, type = ?3 WHERE installed_rank = ?4",
            self.table
        );
        let description = description.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &sql,
                    rusqlite::params![checksum, description, migration_type.as_str(), installed_rank],
                )?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)?;
        Ok(())
    }

    fn lock_primitive(&self) -> Arc<dyn LockPrimitive> {
        self.lock.clone()
    }
}
