//! The apply loop.
//!
//! A run moves through `LOCKING -> RECONCILING -> VALIDATING -> APPLYING ->
//! UNLOCKING`. Everything after locking happens inside the lock, and the
//! history is read again there because another process may have migrated
//! while this one waited.

use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::{CallbackContext, CallbackExecutor, Event};
use crate::config::MigrateConfig;
use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::history::{AppliedMigration, AppliedMigrationDraft, SchemaHistory};
use crate::info::{MigrationInfoSet, MigrationState, ReconcileOptions, reconcile};
use crate::lock::LockCoordinator;
use crate::migration::{MigrationType, ResolvedMigration};
use crate::resolver::CompositeResolver;
use crate::version::Version;

/// One migration applied by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateOutput {
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Migration type.
    pub migration_type: MigrationType,
    /// Script identifier.
    pub script: String,
    /// Rank assigned by the history.
    pub installed_rank: i32,
    /// Execution time in milliseconds.
    pub execution_time_ms: i64,
}

/// Outcome of a migrate run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationBatchResult {
    /// Number of migrations applied.
    pub applied: usize,
    /// Whether nothing is left pending.
    pub done: bool,
    /// Schema version before the run.
    pub initial_version: Option<Version>,
    /// Schema version after the run.
    pub target_version: Option<Version>,
    /// Applied migrations in order.
    pub migrations: Vec<MigrateOutput>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
    /// Whether the run stopped early because it was cancelled.
    pub cancelled: bool,
    /// Whether a baseline marker was written first.
    pub baselined: bool,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
}

impl MigrationBatchResult {
    /// Whether the run changed anything.
    pub fn has_changes(&self) -> bool {
        self.applied > 0 || self.baselined
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        let version = self
            .target_version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| Version::EMPTY.to_string());
        if self.applied == 0 {
            return format!("Schema is up to date at version {version}, no migration necessary");
        }
        let mut summary = format!(
            "Successfully applied {} migration(s), now at version {version} ({}ms)",
            self.applied, self.duration_ms
        );
        if self.cancelled {
            summary.push_str(", stopped early on cancellation");
        }
        summary
    }
}

/// Runs migrations against one history and connection.
pub struct Migrator<'a> {
    config: &'a MigrateConfig,
    history: &'a dyn SchemaHistory,
    connection: &'a dyn DatabaseConnection,
    resolver: &'a CompositeResolver,
    callbacks: &'a CallbackExecutor,
}

impl<'a> Migrator<'a> {
    /// Bind the collaborators of a run.
    pub fn new(
        config: &'a MigrateConfig,
        history: &'a dyn SchemaHistory,
        connection: &'a dyn DatabaseConnection,
        resolver: &'a CompositeResolver,
        callbacks: &'a CallbackExecutor,
    ) -> Self {
        Self {
            config,
            history,
            connection,
            resolver,
            callbacks,
        }
    }

    /// Apply pending migrations up to the configured target.
    ///
    /// `cancel` interrupts lock waits and stops the run between migrations;
    /// a migration that has started always runs to completion.
    pub async fn migrate(&self, cancel: &CancellationToken) -> MigrateResult<MigrationBatchResult> {
        let started = Instant::now();
        let context = CallbackContext::new(self.connection);
        self.callbacks.fire(Event::BeforeMigrate, &context).await?;

        let outcome = self.migrate_inner(cancel).await;
        match outcome {
            Ok(mut result) => {
                result.duration_ms = started.elapsed().as_millis() as i64;
                self.callbacks.fire(Event::AfterMigrate, &context).await?;
                if result.applied > 0 {
                    self.callbacks.fire(Event::AfterMigrateApplied, &context).await?;
                }
                info!("{}", result.summary());
                Ok(result)
            }
            Err(e) => {
                self.callbacks
                    .fire_error(Event::AfterMigrateError, &CallbackContext::new(self.connection).with_error(&e))
                    .await;
                Err(e)
            }
        }
    }

    async fn migrate_inner(&self, cancel: &CancellationToken) -> MigrateResult<MigrationBatchResult> {
        let coordinator = LockCoordinator::new(self.history.lock_primitive(), self.config.lock.clone())
            .with_cancellation(cancel.clone());
        coordinator.with_lock(|| self.migrate_locked(cancel)).await
    }

    async fn migrate_locked(&self, cancel: &CancellationToken) -> MigrateResult<MigrationBatchResult> {
        let mut result = MigrationBatchResult::default();

        if !self.history.exists().await? {
            let empty = self.connection.is_schema_empty().await?;
            if !empty && !self.config.baseline_on_migrate {
                return Err(MigrationError::config(
                    "Found non-empty schema without schema history. \
                     Run baseline or enable baseline_on_migrate.",
                ));
            }
            info!(history = self.history.name(), "Creating schema history");
            self.history.create().await?;
            if !empty {
                self.record_baseline().await?;
                result.baselined = true;
            }
        }

        let resolved = self.resolver.resolve(self.config).await?;
        let options = ReconcileOptions::from_config(self.config);
        let infos = reconcile(&resolved, &self.history.all_applied().await?, &options)?;

        if self.config.validate_on_migrate {
            let validation = infos.validate(&self.config.ignore_migration_patterns, true);
            if !validation.is_valid() {
                return Err(MigrationError::Validation(validation));
            }
        }

        self.check_history(&infos, &mut result.warnings)?;
        result.initial_version = infos.current().and_then(|i| i.version().cloned());
        info!(
            version = %result.initial_version.as_ref().unwrap_or(&Version::EMPTY),
            "Current version of schema"
        );

        let pending: Vec<ResolvedMigration> = infos
            .pending()
            .into_iter()
            .filter_map(|i| i.resolved().cloned())
            .collect();
        debug!(count = pending.len(), "Pending migrations");

        let mut previous_versioned = true;
        for migration in &pending {
            if cancel.is_cancelled() {
                warn!(applied = result.applied, "Migration run cancelled");
                result.cancelled = true;
                break;
            }
            if previous_versioned && migration.is_repeatable() {
                let context = CallbackContext::new(self.connection);
                self.callbacks.fire(Event::AfterVersioned, &context).await?;
                self.callbacks.fire(Event::BeforeRepeatables, &context).await?;
                previous_versioned = false;
            }
            if migration.version.as_ref().is_some_and(|v| infos.last_applied() > v) {
                result.warnings.push(format!(
                    "Applying {} out of order",
                    migration.display_name()
                ));
            }

            let output = self.apply(migration).await?;
            result.migrations.push(output);
            result.applied += 1;
        }
        if previous_versioned && !result.cancelled {
            let context = CallbackContext::new(self.connection);
            self.callbacks.fire(Event::AfterVersioned, &context).await?;
        }

        let after = reconcile(&resolved, &self.history.all_applied().await?, &options)?;
        result.target_version = after.current().and_then(|i| i.version().cloned());
        result.done = !result.cancelled && after.pending().is_empty();
        Ok(result)
    }

    fn check_history(&self, infos: &MigrationInfoSet, warnings: &mut Vec<String>) -> MigrateResult<()> {
        let future_ignored = self
            .config
            .ignore_migration_patterns
            .iter()
            .any(|p| p.matches(true, MigrationState::FutureFailed));

        for failed in infos.failed() {
            let name = failed
                .applied()
                .map(|a| a.display_name())
                .unwrap_or_else(|| failed.description().to_string());
            if failed.state() == MigrationState::FutureFailed && future_ignored {
                warn!(migration = %name, "Schema history contains a failed future migration");
                warnings.push(format!("Failed future migration {name} ignored"));
                continue;
            }
            return Err(MigrationError::FailedMigrationInHistory(name));
        }

        if let Some(newest) = infos.future().last() {
            let message = format!(
                "Schema has version {} which is newer than the latest available migration",
                newest.version().unwrap_or(&Version::EMPTY)
            );
            warn!("{message}");
            warnings.push(message);
        }
        Ok(())
    }

    async fn record_baseline(&self) -> MigrateResult<()> {
        let draft = baseline_draft(self.config);
        info!(version = %self.config.baseline_version, "Baselining non-empty schema");
        self.history.record(draft).await?;
        Ok(())
    }

    /// Apply one migration.
    ///
    /// With atomic DDL the script, the `AfterEachMigrate` callbacks and the
    /// history row share one transaction. Otherwise a failure leaves a
    /// failed row behind.
    async fn apply(&self, migration: &ResolvedMigration) -> MigrateResult<MigrateOutput> {
        let name = migration.display_name();
        info!(migration = %name, "Migrating schema");
        let context = CallbackContext::new(self.connection).with_migration(migration);
        self.callbacks.fire(Event::BeforeEachMigrate, &context).await?;

        let atomic = self.connection.supports_atomic_ddl() && migration.executor.can_execute_in_transaction();
        if atomic {
            self.connection.begin().await?;
        }
        let started = Instant::now();
        let outcome = migration.executor.execute(self.connection).await;
        let execution_time_ms = started.elapsed().as_millis() as i64;

        let mut draft = AppliedMigrationDraft {
            version: migration.version.clone(),
            description: migration.description.clone(),
            migration_type: migration.migration_type,
            script: migration.script.clone(),
            checksum: migration.checksum,
            installed_by: self.config.resolve_installed_by(),
            execution_time_ms,
            success: true,
        };

        match outcome {
            Ok(()) => {
                let finished = self.finish(draft, &context, atomic).await;
                if finished.is_err() && atomic {
                    self.rollback().await;
                }
                let row = finished?;
                debug!(rank = row.installed_rank, execution_time_ms, "Recorded migration");
                Ok(MigrateOutput {
                    version: row.version,
                    description: row.description,
                    migration_type: row.migration_type,
                    script: row.script,
                    installed_rank: row.installed_rank,
                    execution_time_ms,
                })
            }
            Err(e) => {
                if atomic {
                    self.rollback().await;
                    error!(migration = %name, error = %e, "Migration failed, changes rolled back");
                } else {
                    draft.success = false;
                    self.history.record(draft).await?;
                    error!(migration = %name, error = %e, "Migration failed, recorded as failed");
                }
                self.callbacks
                    .fire_error(Event::AfterEachMigrateError, &context.with_error(&e))
                    .await;
                Err(MigrationError::MigrationFailed {
                    migration: format!("{name} ({})", migration.physical_location),
                    recorded: !atomic,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn finish(
        &self,
        draft: AppliedMigrationDraft,
        context: &CallbackContext<'_>,
        atomic: bool,
    ) -> MigrateResult<AppliedMigration> {
        self.callbacks.fire(Event::AfterEachMigrate, context).await?;
        let row = self.history.record(draft).await?;
        if atomic {
            self.connection.commit().await?;
        }
        Ok(row)
    }

    async fn rollback(&self) {
        if let Err(e) = self.connection.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

/// Draft of a baseline marker row.
pub(crate) fn baseline_draft(config: &MigrateConfig) -> AppliedMigrationDraft {
    AppliedMigrationDraft {
        version: Some(config.baseline_version.clone()),
        description: config.baseline_description.clone(),
        migration_type: MigrationType::Baseline,
        script: config.baseline_description.clone(),
        checksum: None,
        installed_by: config.resolve_installed_by(),
        execution_time_ms: 0,
        success: true,
    }
}
