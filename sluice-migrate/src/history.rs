//! Schema history: the persisted log of applied migrations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::lock::{InMemoryLock, LockPrimitive};
use crate::migration::{MigrationType, describe};
use crate::version::Version;

/// Default name of the schema history table.
pub const DEFAULT_TABLE: &str = "sluice_schema_history";

/// A row of the schema history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Unique, monotonically increasing apply order.
    pub installed_rank: i32,
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Migration type.
    pub migration_type: MigrationType,
    /// Script identifier.
    pub script: String,
    /// Checksum at apply time.
    pub checksum: Option<i32>,
    /// Principal that applied the migration.
    pub installed_by: String,
    /// When the migration was applied.
    pub installed_on: DateTime<Utc>,
    /// Execution time in milliseconds.
    pub execution_time_ms: i64,
    /// Whether the migration succeeded.
    pub success: bool,
}

impl AppliedMigration {
    /// Text used in log lines and errors.
    pub fn display_name(&self) -> String {
        describe(self.version.as_ref(), &self.description)
    }
}

/// A history row before the store assigns its rank and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigrationDraft {
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Migration type.
    pub migration_type: MigrationType,
    /// Script identifier.
    pub script: String,
    /// Checksum.
    pub checksum: Option<i32>,
    /// Principal applying the migration.
    pub installed_by: String,
    /// Execution time in milliseconds.
    pub execution_time_ms: i64,
    /// Whether the migration succeeded.
    pub success: bool,
}

impl AppliedMigrationDraft {
    /// Finish the draft into a row.
    pub fn into_applied(self, installed_rank: i32, installed_on: DateTime<Utc>) -> AppliedMigration {
        AppliedMigration {
            installed_rank,
            version: self.version,
            description: self.description,
            migration_type: self.migration_type,
            script: self.script,
            checksum: self.checksum,
            installed_by: self.installed_by,
            installed_on,
            execution_time_ms: self.execution_time_ms,
            success: self.success,
        }
    }
}

/// Storage of the schema history.
///
/// Writers must hold the lock returned by [`SchemaHistory::lock_primitive`];
/// readers may read at any time and always observe whole rows.
#[async_trait::async_trait]
pub trait SchemaHistory: Send + Sync {
    /// Name of the history resource, for log lines.
    fn name(&self) -> &str;

    /// Whether the history table exists.
    async fn exists(&self) -> MigrateResult<bool>;

    /// Create the history table if it does not exist.
    async fn create(&self) -> MigrateResult<()>;

    /// All rows ordered by installed rank.
    async fn all_applied(&self) -> MigrateResult<Vec<AppliedMigration>>;

    /// Append a row with the next installed rank.
    async fn record(&self, draft: AppliedMigrationDraft) -> MigrateResult<AppliedMigration>;

    /// Delete all failed rows, returning them.
    async fn remove_failed(&self) -> MigrateResult<Vec<AppliedMigration>>;

    /// Re-align a row with its resolved migration.
    async fn update_checksum_and_description(
        &self,
        installed_rank: i32,
        checksum: Option<i32>,
        description: &str,
        migration_type: MigrationType,
    ) -> MigrateResult<()>;

    /// The mutual-exclusion primitive guarding this history.
    fn lock_primitive(&self) -> Arc<dyn LockPrimitive>;

    /// Whether any non-synthetic migration has been applied.
    async fn has_applied_migrations(&self) -> MigrateResult<bool> {
        Ok(self
            .all_applied()
            .await?
            .iter()
            .any(|m| !m.migration_type.is_synthetic()))
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    created: bool,
    rows: Vec<AppliedMigration>,
    /// Highest rank ever assigned; removing rows never lowers it.
    last_rank: i32,
}

/// Schema history kept in memory.
///
/// Used for dry runs and tests. Clones share the same rows and lock, so two
/// clones behave like two processes against one database.
#[derive(Debug, Clone, Default)]
pub struct InMemorySchemaHistory {
    state: Arc<Mutex<InMemoryState>>,
    lock: Arc<InMemoryLock>,
}

impl InMemorySchemaHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history pre-populated with rows (ranks are kept as given).
    pub fn with_rows(rows: Vec<AppliedMigration>) -> Self {
        let mut rows = rows;
        rows.sort_by_key(|r| r.installed_rank);
        let last_rank = rows.last().map_or(0, |r| r.installed_rank);
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                created: true,
                rows,
                last_rank,
            })),
            lock: Arc::new(InMemoryLock::new()),
        }
    }

    /// Snapshot an existing history into memory.
    pub async fn snapshot(source: &dyn SchemaHistory) -> MigrateResult<Self> {
        Ok(Self::with_rows(source.all_applied().await?))
    }
}

#[async_trait::async_trait]
impl SchemaHistory for InMemorySchemaHistory {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn exists(&self) -> MigrateResult<bool> {
        Ok(self.state.lock().created)
    }

    async fn create(&self) -> MigrateResult<()> {
        self.state.lock().created = true;
        Ok(())
    }

    async fn all_applied(&self) -> MigrateResult<Vec<AppliedMigration>> {
        Ok(self.state.lock().rows.clone())
    }

    async fn record(&self, draft: AppliedMigrationDraft) -> MigrateResult<AppliedMigration> {
        let mut state = self.state.lock();
        state.created = true;
        state.last_rank += 1;
        let rank = state.last_rank;
        let row = draft.into_applied(rank, Utc::now());
        state.rows.push(row.clone());
        Ok(row)
    }

    async fn remove_failed(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let mut state = self.state.lock();
        let (failed, kept): (Vec<_>, Vec<_>) = state.rows.drain(..).partition(|r| !r.success);
        state.rows = kept;
        Ok(failed)
    }

    async fn update_checksum_and_description(
        &self,
        installed_rank: i32,
        checksum: Option<i32>,
        description: &str,
        migration_type: MigrationType,
    ) -> MigrateResult<()> {
        let mut state = self.state.lock();
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.installed_rank == installed_rank)
            .ok_or_else(|| {
                MigrationError::database(format!("no schema history row with rank {installed_rank}"))
            })?;
        row.checksum = checksum;
        row.description = description.to_string();
        row.migration_type = migration_type;
        Ok(())
    }

    fn lock_primitive(&self) -> Arc<dyn LockPrimitive> {
        self.lock.clone()
    }
}
