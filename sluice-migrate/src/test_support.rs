//! Fixtures shared by unit tests.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::callback::{Callback, CallbackContext, Event};
use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::file::SqlScriptExecutor;
use crate::history::{AppliedMigration, AppliedMigrationDraft};
use crate::migration::{MigrationExecutor, MigrationType, ResolvedMigration};
use crate::version::Version;

fn script_name(version: Option<&str>, description: &str) -> String {
    let desc = description.replace(' ', "_");
    match version {
        Some(v) => format!("V{}__{desc}.sql", v.replace('.', "_")),
        None => format!("R__{desc}.sql"),
    }
}

/// A resolved SQL migration whose script is `-- <description>`.
pub fn resolved(version: Option<&str>, description: &str, checksum: i32) -> ResolvedMigration {
    let script = script_name(version, description);
    ResolvedMigration {
        version: version.map(|v| Version::parse(v).unwrap()),
        description: description.to_string(),
        migration_type: MigrationType::Sql,
        checksum: Some(checksum),
        physical_location: format!("sql/{script}"),
        script,
        executor: Arc::new(SqlScriptExecutor::new(format!("-- {description}"))),
    }
}

/// A history row of type SQL.
pub fn applied(
    rank: i32,
    version: Option<&str>,
    description: &str,
    checksum: Option<i32>,
    success: bool,
) -> AppliedMigration {
    draft(version, description, success)
        .with_checksum(checksum)
        .into_applied(rank, Utc::now())
}

/// A draft of type SQL with no checksum.
pub fn draft(version: Option<&str>, description: &str, success: bool) -> AppliedMigrationDraft {
    AppliedMigrationDraft {
        version: version.map(|v| Version::parse(v).unwrap()),
        description: description.to_string(),
        migration_type: MigrationType::Sql,
        script: script_name(version, description),
        checksum: None,
        installed_by: "tester".to_string(),
        execution_time_ms: 1,
        success,
    }
}

impl AppliedMigrationDraft {
    fn with_checksum(mut self, checksum: Option<i32>) -> Self {
        self.checksum = checksum;
        self
    }
}

/// Executor that declines to run.
pub struct SkippedExecutor;

#[async_trait::async_trait]
impl MigrationExecutor for SkippedExecutor {
    async fn execute(&self, _connection: &dyn DatabaseConnection) -> MigrateResult<()> {
        Ok(())
    }

    fn should_execute(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct ConnectionState {
    log: Vec<String>,
    committed: Vec<String>,
    in_transaction: Vec<String>,
    transaction_open: bool,
}

/// Connection that records statements and fails on request.
///
/// Statements executed inside a rolled-back transaction disappear from
/// [`RecordingConnection::statements`], like DDL on a transactional database.
#[derive(Clone)]
pub struct RecordingConnection {
    state: Arc<Mutex<ConnectionState>>,
    atomic_ddl: bool,
    schema_empty: bool,
    fail_on: Option<String>,
}

impl Default for RecordingConnection {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            atomic_ddl: true,
            schema_empty: true,
            fail_on: None,
        }
    }
}

impl RecordingConnection {
    /// Connection without transactional DDL.
    pub fn non_transactional() -> Self {
        Self {
            atomic_ddl: false,
            ..Self::default()
        }
    }

    /// Fail any statement containing `needle`.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    /// Report the schema as already containing objects.
    pub fn with_existing_objects(mut self) -> Self {
        self.schema_empty = false;
        self
    }

    /// Statements whose effect persisted.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Everything that happened, including transaction control.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

#[async_trait::async_trait]
impl DatabaseConnection for RecordingConnection {
    async fn execute_batch(&self, sql: &str) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.log.push(sql.to_string());
        if self.fail_on.as_deref().is_some_and(|needle| sql.contains(needle)) {
            return Err(MigrationError::database(format!("statement failed: {sql}")));
        }
        if state.transaction_open {
            state.in_transaction.push(sql.to_string());
        } else {
            state.committed.push(sql.to_string());
        }
        Ok(())
    }

    async fn begin(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.log.push("BEGIN".to_string());
        state.transaction_open = true;
        Ok(())
    }

    async fn commit(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.log.push("COMMIT".to_string());
        state.transaction_open = false;
        let pending = std::mem::take(&mut state.in_transaction);
        state.committed.extend(pending);
        Ok(())
    }

    async fn rollback(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.log.push("ROLLBACK".to_string());
        state.transaction_open = false;
        state.in_transaction.clear();
        Ok(())
    }

    fn supports_atomic_ddl(&self) -> bool {
        self.atomic_ddl
    }

    async fn is_schema_empty(&self) -> MigrateResult<bool> {
        Ok(self.schema_empty)
    }
}

/// Shared log written by test callbacks.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Callback logging `<name>:<event>` for `only` or every event.
    pub fn callback(&self, name: &str, only: Option<Event>) -> LoggingCallback {
        LoggingCallback {
            name: name.to_string(),
            only,
            fail: false,
            log: self.clone(),
        }
    }

    /// Callback failing on `event`.
    pub fn failing_callback(&self, name: &str, event: Event) -> LoggingCallback {
        LoggingCallback {
            name: name.to_string(),
            only: Some(event),
            fail: true,
            log: self.clone(),
        }
    }

    /// Logged entries.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Logged event ids, without callback names.
    pub fn events(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.split_once(':').map(|(_, event)| event.to_string()))
            .collect()
    }
}

/// Callback used by [`EventLog`].
pub struct LoggingCallback {
    name: String,
    only: Option<Event>,
    fail: bool,
    log: EventLog,
}

#[async_trait::async_trait]
impl Callback for LoggingCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, event: Event) -> bool {
        self.only.is_none_or(|only| only == event)
    }

    async fn handle(&self, event: Event, _context: &CallbackContext<'_>) -> MigrateResult<()> {
        self.log.entries.lock().push(format!("{}:{event}", self.name));
        if self.fail {
            return Err(MigrationError::other("vetoed"));
        }
        Ok(())
    }
}
