//! SQL migration files on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::MigrateConfig;
use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::migration::{MigrationExecutor, MigrationType, ResolvedMigration, checksum};
use crate::resolver::{MigrationProvider, ProviderKind};

/// First-line directive that keeps a script out of a transaction.
pub const NO_TRANSACTION_DIRECTIVE: &str = "-- sluice:no-transaction";

/// Executes the content of a SQL script.
#[derive(Debug, Clone)]
pub struct SqlScriptExecutor {
    sql: String,
    in_transaction: bool,
}

impl SqlScriptExecutor {
    /// Create an executor for the given script content.
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let in_transaction = !sql
            .lines()
            .next()
            .is_some_and(|line| line.trim() == NO_TRANSACTION_DIRECTIVE);
        Self {
            sql,
            in_transaction,
        }
    }

    /// The script content.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait::async_trait]
impl MigrationExecutor for SqlScriptExecutor {
    async fn execute(&self, connection: &dyn DatabaseConnection) -> MigrateResult<()> {
        connection.execute_batch(&self.sql).await
    }

    fn can_execute_in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Discovers SQL migrations in the configured locations.
///
/// Locations are scanned recursively. Files that do not look like migrations
/// are ignored; files that look like migrations but cannot be parsed are
/// skipped with a warning, or abort resolution when
/// `validate_migration_naming` is enabled.
#[derive(Debug, Clone, Default)]
pub struct SqlFileProvider {
    extra_locations: Vec<PathBuf>,
}

impl SqlFileProvider {
    /// Create a provider that reads `config.locations`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also scan the given directory.
    pub fn with_location(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_locations.push(dir.into());
        self
    }

    async fn list_files(root: &Path) -> MigrateResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !root.exists() {
            debug!("Migration location does not exist: {:?}", root);
            return Ok(files);
        }

        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn read_migration(
        config: &MigrateConfig,
        root: &Path,
        path: &Path,
        file_name: &str,
    ) -> MigrateResult<ResolvedMigration> {
        let parsed = config.naming.parse(file_name)?;
        let sql = tokio::fs::read_to_string(path).await?;
        let script = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        Ok(ResolvedMigration {
            version: parsed.version,
            description: parsed.description,
            migration_type: if parsed.baseline {
                MigrationType::SqlBaseline
            } else {
                MigrationType::Sql
            },
            checksum: Some(checksum(&sql)),
            script,
            physical_location: path.display().to_string(),
            executor: Arc::new(SqlScriptExecutor::new(sql)),
        })
    }
}

#[async_trait::async_trait]
impl MigrationProvider for SqlFileProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Filesystem
    }

    fn name(&self) -> &str {
        "sql"
    }

    async fn resolve(&self, config: &MigrateConfig) -> MigrateResult<Vec<ResolvedMigration>> {
        let mut migrations = Vec::new();

        for root in config.locations.iter().chain(&self.extra_locations) {
            for path in Self::list_files(root).await? {
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !config.naming.matches(file_name) {
                    continue;
                }

                match Self::read_migration(config, root, &path, file_name).await {
                    Ok(migration) => migrations.push(migration),
                    Err(err) if err.is_descriptor_format() && !config.validate_migration_naming => {
                        warn!(path = %path.display(), error = %err, "Skipping unresolvable migration");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(migrations)
    }
}

/// Reject a location that is a file rather than a directory.
pub fn check_location(path: &Path) -> MigrateResult<()> {
    if path.exists() && !path.is_dir() {
        return Err(MigrationError::config(format!(
            "migration location {} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_resolves_versioned_and_repeatable() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "V1__Create.sql", "CREATE TABLE t (id INT);");
        write(temp.path(), "R__Views.sql", "CREATE VIEW v AS SELECT 1;");
        write(temp.path(), "README.md", "not a migration");

        let config = MigrateConfig::new().location(temp.path());
        let found = SqlFileProvider::new().resolve(&config).await.unwrap();

        assert_eq!(found.len(), 2);
        let v1 = found.iter().find(|m| m.version.is_some()).unwrap();
        assert_eq!(v1.version, Some(Version::parse("1").unwrap()));
        assert_eq!(v1.description, "Create");
        assert_eq!(v1.script, "V1__Create.sql");
        assert_eq!(v1.checksum, Some(checksum("CREATE TABLE t (id INT);")));
        assert_eq!(v1.migration_type, MigrationType::Sql);
    }

    #[tokio::test]
    async fn test_scans_subdirectories() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("2024").join("q1");
        std::fs::create_dir_all(&nested).unwrap();
        write(&nested, "V2__Nested.sql", "SELECT 1;");

        let config = MigrateConfig::new().location(temp.path());
        let found = SqlFileProvider::new().resolve(&config).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].script, "2024/q1/V2__Nested.sql");
    }

    #[tokio::test]
    async fn test_malformed_name_skipped_or_fatal() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "V1__ok.sql", "SELECT 1;");
        write(temp.path(), "V1.a__bad.sql", "SELECT 2;");

        let lenient = MigrateConfig::new().location(temp.path());
        let found = SqlFileProvider::new().resolve(&lenient).await.unwrap();
        assert_eq!(found.len(), 1);

        let strict = MigrateConfig::new()
            .location(temp.path())
            .validate_migration_naming(true);
        let err = SqlFileProvider::new().resolve(&strict).await.unwrap_err();
        assert!(err.to_string().contains("V1.a__bad.sql"));
    }

    #[tokio::test]
    async fn test_baseline_script_type() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "B3__Snapshot.sql", "SELECT 1;");
        let config = MigrateConfig::new().location(temp.path());
        let found = SqlFileProvider::new().resolve(&config).await.unwrap();
        assert_eq!(found[0].migration_type, MigrationType::SqlBaseline);
    }

    #[tokio::test]
    async fn test_missing_location_is_empty() {
        let config = MigrateConfig::new().location("/definitely/not/here");
        assert!(SqlFileProvider::new().resolve(&config).await.unwrap().is_empty());
    }

    #[test]
    fn test_no_transaction_directive() {
        let exec = SqlScriptExecutor::new("-- sluice:no-transaction\nCREATE INDEX CONCURRENTLY i ON t (id);");
        assert!(!exec.can_execute_in_transaction());
        assert!(SqlScriptExecutor::new("SELECT 1;").can_execute_in_transaction());
    }

    #[test]
    fn test_check_location_rejects_file() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "x.sql", "");
        assert!(check_location(&temp.path().join("x.sql")).is_err());
        assert!(check_location(temp.path()).is_ok());
    }
}
