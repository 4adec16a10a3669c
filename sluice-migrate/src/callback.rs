//! Lifecycle callbacks.
//!
//! Callbacks observe (and may veto) engine operations. They are registered
//! on the engine explicitly, or discovered as SQL scripts named after an
//! event (`beforeMigrate.sql`, `afterEachMigrate__refresh_stats.sql`) in the
//! migration locations.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::MigrateConfig;
use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::migration::ResolvedMigration;

/// Points in an operation where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Before migrate takes the lock.
    BeforeMigrate,
    /// Before each migration is applied.
    BeforeEachMigrate,
    /// After each migration succeeded.
    AfterEachMigrate,
    /// After a migration failed.
    AfterEachMigrateError,
    /// After the last versioned migration of a run.
    AfterVersioned,
    /// Before the first repeatable migration of a run.
    BeforeRepeatables,
    /// After migrate succeeded.
    AfterMigrate,
    /// After migrate succeeded and applied at least one migration.
    AfterMigrateApplied,
    /// After migrate failed.
    AfterMigrateError,
    /// Before validate.
    BeforeValidate,
    /// After validate found nothing.
    AfterValidate,
    /// After validate found discrepancies.
    AfterValidateError,
    /// Before repair.
    BeforeRepair,
    /// After repair.
    AfterRepair,
    /// Before baseline.
    BeforeBaseline,
    /// After baseline.
    AfterBaseline,
}

impl Event {
    /// All events.
    pub const ALL: [Event; 16] = [
        Self::BeforeMigrate,
        Self::BeforeEachMigrate,
        Self::AfterEachMigrate,
        Self::AfterEachMigrateError,
        Self::AfterVersioned,
        Self::BeforeRepeatables,
        Self::AfterMigrate,
        Self::AfterMigrateApplied,
        Self::AfterMigrateError,
        Self::BeforeValidate,
        Self::AfterValidate,
        Self::AfterValidateError,
        Self::BeforeRepair,
        Self::AfterRepair,
        Self::BeforeBaseline,
        Self::AfterBaseline,
    ];

    /// Identifier used in script names.
    pub fn id(&self) -> &'static str {
        match self {
            Self::BeforeMigrate => "beforeMigrate",
            Self::BeforeEachMigrate => "beforeEachMigrate",
            Self::AfterEachMigrate => "afterEachMigrate",
            Self::AfterEachMigrateError => "afterEachMigrateError",
            Self::AfterVersioned => "afterVersioned",
            Self::BeforeRepeatables => "beforeRepeatables",
            Self::AfterMigrate => "afterMigrate",
            Self::AfterMigrateApplied => "afterMigrateApplied",
            Self::AfterMigrateError => "afterMigrateError",
            Self::BeforeValidate => "beforeValidate",
            Self::AfterValidate => "afterValidate",
            Self::AfterValidateError => "afterValidateError",
            Self::BeforeRepair => "beforeRepair",
            Self::AfterRepair => "afterRepair",
            Self::BeforeBaseline => "beforeBaseline",
            Self::AfterBaseline => "afterBaseline",
        }
    }

    /// Look up an event by identifier.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.id() == id)
    }

    /// Whether this event reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::AfterEachMigrateError | Self::AfterMigrateError | Self::AfterValidateError
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// What a callback can see.
pub struct CallbackContext<'a> {
    /// Connection migrations run on.
    pub connection: &'a dyn DatabaseConnection,
    /// Migration being applied, for per-migration events.
    pub migration: Option<&'a ResolvedMigration>,
    /// Failure being reported, for error events.
    pub error: Option<&'a MigrationError>,
}

impl<'a> CallbackContext<'a> {
    /// Context without a migration or error.
    pub fn new(connection: &'a dyn DatabaseConnection) -> Self {
        Self {
            connection,
            migration: None,
            error: None,
        }
    }

    /// Attach the current migration.
    pub fn with_migration(mut self, migration: &'a ResolvedMigration) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Attach a failure.
    pub fn with_error(mut self, error: &'a MigrationError) -> Self {
        self.error = Some(error);
        self
    }
}

/// A hook into engine operations.
#[async_trait::async_trait]
pub trait Callback: Send + Sync {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Whether this callback handles `event`.
    fn supports(&self, event: Event) -> bool;

    /// Handle an event. An error aborts the operation.
    async fn handle(&self, event: Event, context: &CallbackContext<'_>) -> MigrateResult<()>;
}

/// Dispatches events to callbacks in registration order.
#[derive(Clone, Default)]
pub struct CallbackExecutor {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackExecutor {
    /// Create an executor without callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn register(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Registered callbacks.
    pub fn callbacks(&self) -> &[Arc<dyn Callback>] {
        &self.callbacks
    }

    /// Run every callback supporting `event`, stopping at the first failure.
    pub async fn fire(&self, event: Event, context: &CallbackContext<'_>) -> MigrateResult<()> {
        for callback in self.callbacks.iter().filter(|c| c.supports(event)) {
            debug!(callback = callback.name(), %event, "Executing callback");
            callback
                .handle(event, context)
                .await
                .map_err(|e| MigrationError::Callback {
                    callback: callback.name().to_string(),
                    event: event.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Run callbacks for an error event; their own failures are only logged.
    pub async fn fire_error(&self, event: Event, context: &CallbackContext<'_>) {
        if let Err(e) = self.fire(event, context).await {
            warn!(%event, error = %e, "Callback failed while reporting an error");
        }
    }
}

/// A SQL script bound to one event.
#[derive(Debug, Clone)]
pub struct SqlCallback {
    event: Event,
    name: String,
    sql: String,
}

impl SqlCallback {
    /// Create a callback running `sql` on `event`.
    pub fn new(event: Event, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            event,
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Parse a script name such as `afterMigrate__vacuum.sql`.
    pub fn event_for(config: &MigrateConfig, file_name: &str) -> Option<Event> {
        let stem = config.naming.strip_suffix(file_name)?;
        let id = match stem.split_once(config.naming.separator.as_str()) {
            Some((id, _)) => id,
            None => stem,
        };
        Event::from_id(id)
    }

    /// Find callback scripts in the configured locations (top level only).
    pub async fn scan(config: &MigrateConfig) -> MigrateResult<Vec<SqlCallback>> {
        let mut found = Vec::new();
        for location in &config.locations {
            found.extend(Self::scan_dir(config, location).await?);
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn scan_dir(config: &MigrateConfig, dir: &Path) -> MigrateResult<Vec<SqlCallback>> {
        let mut found = Vec::new();
        if !dir.is_dir() {
            return Ok(found);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(event) = Self::event_for(config, file_name) {
                let sql = tokio::fs::read_to_string(&path).await?;
                found.push(Self::new(event, file_name, sql));
            }
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl Callback for SqlCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, event: Event) -> bool {
        event == self.event
    }

    async fn handle(&self, _event: Event, context: &CallbackContext<'_>) -> MigrateResult<()> {
        context.connection.execute_batch(&self.sql).await
    }
}
