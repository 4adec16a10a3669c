//! Migration engine facade.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::{Callback, CallbackContext, CallbackExecutor, Event, SqlCallback};
use crate::config::MigrateConfig;
use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::file::SqlFileProvider;
use crate::history::{AppliedMigration, SchemaHistory};
use crate::info::{MigrationInfoSet, MigrationState, ReconcileOptions, reconcile};
use crate::lock::LockCoordinator;
use crate::migrate::{MigrationBatchResult, Migrator, baseline_draft};
use crate::migration::MigrationType;
use crate::resolver::{CompositeResolver, MigrationProvider};
use crate::validate::ValidationResult;

/// Result of a repair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairResult {
    /// Number of failed rows removed.
    pub removed: usize,
    /// Number of rows re-aligned with their resolved migration.
    pub aligned: usize,
    /// Display names of removed rows.
    pub removed_migrations: Vec<String>,
    /// Display names of aligned rows.
    pub aligned_migrations: Vec<String>,
}

impl RepairResult {
    /// Whether the history changed.
    pub fn has_changes(&self) -> bool {
        self.removed > 0 || self.aligned > 0
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        if !self.has_changes() {
            return "Schema history needed no repair".to_string();
        }
        format!(
            "Removed {} failed migration(s), aligned {} migration(s)",
            self.removed, self.aligned
        )
    }
}

/// Result of a baseline.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineResult {
    /// The marker row.
    pub marker: AppliedMigration,
    /// Whether the marker was written by this call.
    pub created: bool,
}

/// Entry point tying configuration, resolvers, history and callbacks together.
///
/// The engine holds no state between operations: every call resolves
/// migrations and reads the history afresh.
pub struct MigrationEngine {
    config: MigrateConfig,
    history: Arc<dyn SchemaHistory>,
    connection: Arc<dyn DatabaseConnection>,
    resolver: CompositeResolver,
    callbacks: CallbackExecutor,
}

impl MigrationEngine {
    /// Create an engine reading SQL migrations from `config.locations`
    /// unless `skip_default_resolvers` is set.
    pub fn new(
        config: MigrateConfig,
        history: Arc<dyn SchemaHistory>,
        connection: Arc<dyn DatabaseConnection>,
    ) -> Self {
        let mut resolver = CompositeResolver::new();
        if !config.skip_default_resolvers {
            resolver.add_provider(Arc::new(SqlFileProvider::new()));
        }
        Self {
            config,
            history,
            connection,
            resolver,
            callbacks: CallbackExecutor::new(),
        }
    }

    /// Add a migration provider.
    pub fn with_provider(mut self, provider: Arc<dyn MigrationProvider>) -> Self {
        self.resolver.add_provider(provider);
        self
    }

    /// Register a callback.
    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.register(callback);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// The schema history.
    pub fn history(&self) -> &Arc<dyn SchemaHistory> {
        &self.history
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> MigrateResult<MigrationBatchResult> {
        self.migrate_with_cancel(CancellationToken::new()).await
    }

    /// Apply pending migrations, stopping between migrations once `cancel` fires.
    pub async fn migrate_with_cancel(&self, cancel: CancellationToken) -> MigrateResult<MigrationBatchResult> {
        self.config.check()?;
        let callbacks = self.callbacks().await?;
        Migrator::new(
            &self.config,
            self.history.as_ref(),
            self.connection.as_ref(),
            &self.resolver,
            &callbacks,
        )
        .migrate(&cancel)
        .await
    }

    /// Report every migration and its state. Does not take the lock.
    pub async fn info(&self) -> MigrateResult<MigrationInfoSet> {
        let resolved = self.resolver.resolve(&self.config).await?;
        let applied = if self.history.exists().await? {
            self.history.all_applied().await?
        } else {
            Vec::new()
        };
        reconcile(&resolved, &applied, &ReconcileOptions::from_config(&self.config))
    }

    /// Compare resolved migrations with the history.
    ///
    /// Findings are returned, not raised; use
    /// [`ValidationResult::into_result`] to fail on them.
    pub async fn validate(&self) -> MigrateResult<ValidationResult> {
        let callbacks = self.callbacks().await?;
        let context = CallbackContext::new(self.connection.as_ref());
        callbacks.fire(Event::BeforeValidate, &context).await?;

        let result = self
            .info()
            .await?
            .validate(&self.config.ignore_migration_patterns, false);

        if result.is_valid() {
            info!(validated = result.validated, "Successfully validated migrations");
            callbacks.fire(Event::AfterValidate, &context).await?;
        } else {
            warn!(errors = result.errors.len(), "Validation failed");
            let error = MigrationError::Validation(result.clone());
            callbacks
                .fire_error(Event::AfterValidateError, &context.with_error(&error))
                .await;
        }
        Ok(result)
    }

    /// Remove failed rows and re-align checksums, descriptions and types
    /// with the resolved migrations.
    pub async fn repair(&self) -> MigrateResult<RepairResult> {
        let callbacks = self.callbacks().await?;
        let context = CallbackContext::new(self.connection.as_ref());
        callbacks.fire(Event::BeforeRepair, &context).await?;

        if !self.history.exists().await? {
            info!("Schema history does not exist, nothing to repair");
            callbacks.fire(Event::AfterRepair, &context).await?;
            return Ok(RepairResult::default());
        }

        let result = self
            .coordinator()
            .with_lock(|| self.repair_locked())
            .await?;
        info!("{}", result.summary());
        callbacks.fire(Event::AfterRepair, &context).await?;
        Ok(result)
    }

    async fn repair_locked(&self) -> MigrateResult<RepairResult> {
        let mut result = RepairResult::default();

        for row in self.history.remove_failed().await? {
            info!(migration = %row.display_name(), rank = row.installed_rank, "Removed failed migration");
            result.removed_migrations.push(row.display_name());
        }
        result.removed = result.removed_migrations.len();

        let resolved = self.resolver.resolve(&self.config).await?;
        let options = ReconcileOptions::from_config(&self.config);
        let infos = reconcile(&resolved, &self.history.all_applied().await?, &options)?;
        let baseline = infos.baseline().clone();

        for info in infos.all() {
            let (Some(applied), Some(migration)) = (info.applied(), info.resolved()) else {
                continue;
            };
            // Marker rows carry no script of their own and keep their type.
            if applied.migration_type.is_synthetic() {
                continue;
            }
            // Outdated repeatables keep their checksum so migrate re-runs them.
            let candidate = match &applied.version {
                Some(version) => *version > baseline,
                None => !matches!(info.state(), MigrationState::Superseded | MigrationState::Outdated),
            };
            // A differing type alone never triggers an update.
            let drifted = applied.checksum != migration.checksum || applied.description != migration.description;
            if !candidate || !drifted {
                continue;
            }

            self.history
                .update_checksum_and_description(
                    applied.installed_rank,
                    migration.checksum,
                    &migration.description,
                    migration.migration_type,
                )
                .await?;
            debug!(
                migration = %applied.display_name(),
                rank = applied.installed_rank,
                "Aligned migration with resolved script"
            );
            result.aligned_migrations.push(applied.display_name());
        }
        result.aligned = result.aligned_migrations.len();
        Ok(result)
    }

    /// Mark the existing schema as being at `baseline_version`.
    ///
    /// Calling it again with the same settings is a no-op. Fails once
    /// migrations have been applied, or when a different baseline exists.
    pub async fn baseline(&self) -> MigrateResult<BaselineResult> {
        let callbacks = self.callbacks().await?;
        let context = CallbackContext::new(self.connection.as_ref());
        callbacks.fire(Event::BeforeBaseline, &context).await?;

        if !self.history.exists().await? {
            self.history.create().await?;
        }
        let result = self
            .coordinator()
            .with_lock(|| self.baseline_locked())
            .await?;
        callbacks.fire(Event::AfterBaseline, &context).await?;
        Ok(result)
    }

    async fn baseline_locked(&self) -> MigrateResult<BaselineResult> {
        let rows = self.history.all_applied().await?;
        if let Some(marker) = rows.iter().find(|r| r.migration_type == MigrationType::Baseline) {
            if marker.version.as_ref() == Some(&self.config.baseline_version)
                && marker.description == self.config.baseline_description
            {
                debug!(version = %self.config.baseline_version, "Baseline already present");
                return Ok(BaselineResult {
                    marker: marker.clone(),
                    created: false,
                });
            }
            return Err(MigrationError::config(format!(
                "Unable to baseline schema history with version {} as it already contains baseline {}",
                self.config.baseline_version,
                marker.display_name()
            )));
        }
        if rows.iter().any(|r| !r.migration_type.is_synthetic()) {
            return Err(MigrationError::config(format!(
                "Unable to baseline schema history with version {} as it already contains migrations",
                self.config.baseline_version
            )));
        }

        let marker = self.history.record(baseline_draft(&self.config)).await?;
        info!(version = %self.config.baseline_version, "Successfully baselined schema");
        Ok(BaselineResult { marker, created: true })
    }

    fn coordinator(&self) -> LockCoordinator {
        LockCoordinator::new(self.history.lock_primitive(), self.config.lock.clone())
    }

    async fn callbacks(&self) -> MigrateResult<CallbackExecutor> {
        let mut callbacks = self.callbacks.clone();
        for callback in SqlCallback::scan(&self.config).await? {
            callbacks.register(Arc::new(callback));
        }
        Ok(callbacks)
    }
}
