//! Connection capability consumed by migration executors.

use crate::error::MigrateResult;

/// A live database connection migrations are applied through.
///
/// The engine only needs to run scripts, bracket them in a transaction and
/// know whether DDL participates in that transaction.
#[async_trait::async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Execute a script of one or more statements.
    async fn execute_batch(&self, sql: &str) -> MigrateResult<()>;

    /// Begin a transaction.
    async fn begin(&self) -> MigrateResult<()>;

    /// Commit the current transaction.
    async fn commit(&self) -> MigrateResult<()>;

    /// Roll back the current transaction.
    async fn rollback(&self) -> MigrateResult<()>;

    /// Whether DDL statements are rolled back together with the transaction.
    fn supports_atomic_ddl(&self) -> bool;

    /// Whether the target schema has no user objects yet.
    async fn is_schema_empty(&self) -> MigrateResult<bool>;
}
