//! SQLite connection migrations are applied through.

use std::sync::Arc;

use sluice_migrate::{DatabaseConnection, LockConfig, MigrateResult};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::config::{DatabasePath, SqliteConfig};
use crate::error::{SqliteError, SqliteResult};
use crate::history::SqliteSchemaHistory;

/// A handle to one SQLite database.
///
/// Clones share the underlying connection thread, so a transaction begun
/// through one clone is visible to all of them.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Connection,
    config: Arc<SqliteConfig>,
}

impl SqliteDatabase {
    /// Open a connection with the given configuration.
    pub async fn open(config: SqliteConfig) -> SqliteResult<Self> {
        config.check()?;
        let init_sql = config.init_sql();

        let conn = match &config.path {
            DatabasePath::Memory => Connection::open_in_memory().await?,
            DatabasePath::File(path) => Connection::open(path).await?,
        };

        conn.call(move |conn| {
            conn.execute_batch(&init_sql)?;
            Ok(())
        })
        .await?;

        debug!(path = %config.path_str(), "Opened SQLite database");
        Ok(Self {
            conn,
            config: Arc::new(config),
        })
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> SqliteResult<Self> {
        Self::open(SqliteConfig::memory()).await
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The configuration this database was opened with.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Schema history stored in this database.
    pub fn history(&self, lock: &LockConfig) -> SqliteSchemaHistory {
        SqliteSchemaHistory::new(self, lock)
    }

    /// Run a query returning a single integer.
    pub async fn query_i64(&self, sql: &str) -> SqliteResult<i64> {
        let sql = sql.to_string();
        self.conn
            .call(move |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
            .await
            .map_err(SqliteError::from)
    }

    async fn batch(&self, sql: String) -> SqliteResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)
    }
}

#[async_trait::async_trait]
impl DatabaseConnection for SqliteDatabase {
    async fn execute_batch(&self, sql: &str) -> MigrateResult<()> {
        debug!(bytes = sql.len(), "Executing script");
        Ok(self.batch(sql.to_string()).await?)
    }

    async fn begin(&self) -> MigrateResult<()> {
        Ok(self.batch("BEGIN IMMEDIATE".to_string()).await?)
    }

    async fn commit(&self) -> MigrateResult<()> {
        Ok(self.batch("COMMIT".to_string()).await?)
    }

    async fn rollback(&self) -> MigrateResult<()> {
        Ok(self.batch("ROLLBACK".to_string()).await?)
    }

    fn supports_atomic_ddl(&self) -> bool {
        true
    }

    async fn is_schema_empty(&self) -> MigrateResult<bool> {
        let history = self.config.history_table.clone();
        let lock = self.config.lock_table();
        let count: i64 = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master \
                     WHERE type IN ('table', 'view', 'trigger') \
                     AND name NOT LIKE 'sqlite_%' AND name NOT IN (?1, ?2)",
                    [history, lock],
                    |row| row.get(0),
                )?)
            })
            .await
            .map_err(SqliteError::from)?;
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ddl_rolls_back() {
        let db = SqliteDatabase::open_in_memory().await.unwrap();
        assert!(db.is_schema_empty().await.unwrap());

        db.begin().await.unwrap();
        db.execute_batch("CREATE TABLE t (id INTEGER);").await.unwrap();
        db.rollback().await.unwrap();
        assert!(db.is_schema_empty().await.unwrap());

        db.begin().await.unwrap();
        db.execute_batch("CREATE TABLE t (id INTEGER);").await.unwrap();
        db.commit().await.unwrap();
        assert!(!db.is_schema_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_history_tables_do_not_count() {
        let db = SqliteDatabase::open_in_memory().await.unwrap();
        db.execute_batch("CREATE TABLE sluice_schema_history (x INTEGER); CREATE TABLE sluice_schema_history_lock (id INTEGER);")
            .await
            .unwrap();
        assert!(db.is_schema_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_sql_is_database_error() {
        let db = SqliteDatabase::open_in_memory().await.unwrap();
        let err = db.execute_batch("CREATE TABLE (;").await.unwrap_err();
        assert!(matches!(err, sluice_migrate::MigrationError::Database(_)));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("app.db");
        {
            let db = SqliteDatabase::open(SqliteConfig::file(&path)).await.unwrap();
            db.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1);")
                .await
                .unwrap();
        }
        let db = SqliteDatabase::open(SqliteConfig::file(&path)).await.unwrap();
        assert_eq!(db.query_i64("SELECT COUNT(*) FROM t").await.unwrap(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_path_is_a_file() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(OsStr::from_bytes(b"app\xff.db"));
        {
            let db = SqliteDatabase::open(SqliteConfig::file(&path)).await.unwrap();
            db.execute_batch("CREATE TABLE t (id INTEGER);").await.unwrap();
        }
        assert!(path.exists());

        let db = SqliteDatabase::open(SqliteConfig::file(&path)).await.unwrap();
        assert!(!db.is_schema_empty().await.unwrap());
        assert!(db.config().path_str().ends_with(".db"));
    }
}
