//! Migration resolution.
//!
//! Providers discover migrations from one kind of source each; the
//! [`CompositeResolver`] merges them into one sorted, duplicate-free set.

use std::fmt;
use std::sync::Arc;

use crate::config::MigrateConfig;
use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::migration::{MigrationExecutor, MigrationNaming, MigrationType, ResolvedMigration};
use crate::version::Version;

/// Source kind of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Scripts read from directories.
    Filesystem,
    /// Migrations compiled into the application.
    Code,
    /// Anything else supplied by the embedding application.
    Custom,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => f.write_str("filesystem"),
            Self::Code => f.write_str("code"),
            Self::Custom => f.write_str("custom"),
        }
    }
}

/// A source of migrations.
#[async_trait::async_trait]
pub trait MigrationProvider: Send + Sync {
    /// What kind of source this is.
    fn kind(&self) -> ProviderKind;

    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Discover all migrations of this source.
    async fn resolve(&self, config: &MigrateConfig) -> MigrateResult<Vec<ResolvedMigration>>;
}

/// Merges the output of several providers.
#[derive(Default, Clone)]
pub struct CompositeResolver {
    providers: Vec<Arc<dyn MigrationProvider>>,
}

impl CompositeResolver {
    /// Create a resolver without providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider.
    pub fn with_provider(mut self, provider: Arc<dyn MigrationProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Add a provider in place.
    pub fn add_provider(&mut self, provider: Arc<dyn MigrationProvider>) {
        self.providers.push(provider);
    }

    /// Registered providers.
    pub fn providers(&self) -> &[Arc<dyn MigrationProvider>] {
        &self.providers
    }

    /// Resolve, sort and check all migrations.
    ///
    /// Versioned migrations come first in ascending version order, followed by
    /// repeatable migrations ordered by description.
    pub async fn resolve(&self, config: &MigrateConfig) -> MigrateResult<Vec<ResolvedMigration>> {
        let mut migrations = Vec::new();
        for provider in &self.providers {
            let found = provider.resolve(config).await?;
            tracing::debug!(
                provider = provider.name(),
                kind = %provider.kind(),
                count = found.len(),
                "Resolved migrations"
            );
            migrations.extend(found);
        }
        sort_and_check(migrations)
    }
}

/// Sort resolved migrations and reject natural-key collisions.
pub fn sort_and_check(mut migrations: Vec<ResolvedMigration>) -> MigrateResult<Vec<ResolvedMigration>> {
    migrations.sort_by(|a, b| {
        a.natural_key()
            .cmp(&b.natural_key())
            .then_with(|| a.physical_location.cmp(&b.physical_location))
    });

    for pair in migrations.windows(2) {
        let (current, next) = (&pair[0], &pair[1]);
        let key = current.natural_key();
        if key == next.natural_key() {
            return Err(MigrationError::DuplicateMigration {
                key: key.to_string(),
                first: format!("{} ({})", current.physical_location, current.migration_type),
                second: format!("{} ({})", next.physical_location, next.migration_type),
            });
        }
    }

    Ok(migrations)
}

/// Explicit identity for a code migration that does not follow the naming grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMigrationInfo {
    /// Version, `None` for repeatable.
    pub version: Option<Version>,
    /// Description.
    pub description: String,
    /// Checksum, if the migration wants drift detection.
    pub checksum: Option<i32>,
}

/// A migration implemented in Rust.
#[async_trait::async_trait]
pub trait CodeMigration: Send + Sync {
    /// Unit name, e.g. `V2__Seed_users`, parsed with the naming grammar unless
    /// [`CodeMigration::info`] is provided.
    fn name(&self) -> &str;

    /// Explicit version/description/checksum overriding the name.
    fn info(&self) -> Option<CodeMigrationInfo> {
        None
    }

    /// Whether this migration may run inside a transaction.
    fn can_execute_in_transaction(&self) -> bool {
        true
    }

    /// Apply the migration.
    async fn migrate(&self, connection: &dyn DatabaseConnection) -> MigrateResult<()>;
}

struct CodeExecutor(Arc<dyn CodeMigration>);

#[async_trait::async_trait]
impl MigrationExecutor for CodeExecutor {
    async fn execute(&self, connection: &dyn DatabaseConnection) -> MigrateResult<()> {
        self.0.migrate(connection).await
    }

    fn can_execute_in_transaction(&self) -> bool {
        self.0.can_execute_in_transaction()
    }
}

/// Provider for a fixed list of code migrations registered at startup.
#[derive(Default, Clone)]
pub struct CodeMigrationProvider {
    migrations: Vec<Arc<dyn CodeMigration>>,
}

impl CodeMigrationProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration.
    pub fn with_migration(mut self, migration: impl CodeMigration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    fn resolve_one(
        &self,
        naming: &MigrationNaming,
        migration: &Arc<dyn CodeMigration>,
    ) -> MigrateResult<ResolvedMigration> {
        let (version, description, checksum) = match migration.info() {
            Some(info) => (info.version, info.description, info.checksum),
            None => {
                let parsed = naming.parse(migration.name())?;
                (parsed.version, parsed.description, None)
            }
        };
        Ok(ResolvedMigration {
            version,
            description,
            migration_type: MigrationType::Code,
            checksum,
            script: migration.name().to_string(),
            physical_location: format!("code::{}", migration.name()),
            executor: Arc::new(CodeExecutor(Arc::clone(migration))),
        })
    }
}

#[async_trait::async_trait]
impl MigrationProvider for CodeMigrationProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Code
    }

    fn name(&self) -> &str {
        "code"
    }

    async fn resolve(&self, config: &MigrateConfig) -> MigrateResult<Vec<ResolvedMigration>> {
        // Code unit names carry no file suffix.
        let naming = MigrationNaming {
            suffixes: Vec::new(),
            ..config.naming.clone()
        };
        self.migrations
            .iter()
            .map(|m| self.resolve_one(&naming, m))
            .collect()
    }
}
