//! Migration types: descriptors, executors, checksums and the naming grammar.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::connection::DatabaseConnection;
use crate::error::{MigrateResult, MigrationError};
use crate::version::Version;

/// The kind of a migration, as resolved or as recorded in the schema history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    /// SQL script from a migration location.
    Sql,
    /// Migration implemented in Rust code.
    Code,
    /// Migration from a custom provider.
    Custom,
    /// Synthetic marker written by `baseline`.
    Baseline,
    /// Resolved baseline script (`B<version>__<desc>.sql`).
    SqlBaseline,
    /// Synthetic marker for schema creation.
    Schema,
    /// Synthetic marker for a migration removed from history.
    Delete,
}

impl MigrationType {
    /// Name stored in the schema history.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "SQL",
            Self::Code => "CODE",
            Self::Custom => "CUSTOM",
            Self::Baseline => "BASELINE",
            Self::SqlBaseline => "SQL_BASELINE",
            Self::Schema => "SCHEMA",
            Self::Delete => "DELETE",
        }
    }

    /// Parse a stored type name.
    pub fn from_name(name: &str) -> MigrateResult<Self> {
        match name {
            "SQL" => Ok(Self::Sql),
            "CODE" => Ok(Self::Code),
            "CUSTOM" => Ok(Self::Custom),
            "BASELINE" => Ok(Self::Baseline),
            "SQL_BASELINE" => Ok(Self::SqlBaseline),
            "SCHEMA" => Ok(Self::Schema),
            "DELETE" => Ok(Self::Delete),
            other => Err(MigrationError::database(format!(
                "unknown migration type in schema history: {other}"
            ))),
        }
    }

    /// Marker rows that never correspond to a resolved migration.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Baseline | Self::Schema | Self::Delete)
    }

    /// Whether this type establishes a baseline.
    pub fn is_baseline(&self) -> bool {
        matches!(self, Self::Baseline | Self::SqlBaseline)
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies one migration against a live connection.
#[async_trait::async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Run the migration.
    async fn execute(&self, connection: &dyn DatabaseConnection) -> MigrateResult<()>;

    /// Whether the migration may run inside a transaction.
    fn can_execute_in_transaction(&self) -> bool {
        true
    }

    /// Whether the migration should run at all in this environment.
    fn should_execute(&self) -> bool {
        true
    }
}

/// Identity of a migration used to match resolved migrations with history rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    /// Versioned migrations are keyed by version.
    Versioned(Version),
    /// Repeatable migrations are keyed by description.
    Repeatable(String),
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Versioned(v) => write!(f, "version {v}"),
            Self::Repeatable(d) => write!(f, "repeatable description '{d}'"),
        }
    }
}

/// A migration discovered by a provider for this run.
#[derive(Clone)]
pub struct ResolvedMigration {
    /// Version, or `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Description (may be empty).
    pub description: String,
    /// Migration type.
    pub migration_type: MigrationType,
    /// Content checksum, if computable.
    pub checksum: Option<i32>,
    /// Script identifier (e.g. `V1__init.sql`).
    pub script: String,
    /// Physical location the migration was found at.
    pub physical_location: String,
    /// How to apply it.
    pub executor: Arc<dyn MigrationExecutor>,
}

impl ResolvedMigration {
    /// Natural key of this migration.
    pub fn natural_key(&self) -> NaturalKey {
        match &self.version {
            Some(v) => NaturalKey::Versioned(v.clone()),
            None => NaturalKey::Repeatable(self.description.clone()),
        }
    }

    /// Whether this is a repeatable migration.
    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }

    /// Compare with a recorded checksum.
    pub fn checksum_matches(&self, checksum: Option<i32>) -> bool {
        self.checksum == checksum
    }

    /// Text used in log lines and errors, e.g. `version "1.1 - add col"`.
    pub fn display_name(&self) -> String {
        describe(self.version.as_ref(), &self.description)
    }
}

impl fmt::Debug for ResolvedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedMigration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("migration_type", &self.migration_type)
            .field("checksum", &self.checksum)
            .field("script", &self.script)
            .field("physical_location", &self.physical_location)
            .finish_non_exhaustive()
    }
}

pub(crate) fn describe(version: Option<&Version>, description: &str) -> String {
    match version {
        Some(v) if description.is_empty() => format!("version \"{v}\""),
        Some(v) => format!("version \"{v} - {description}\""),
        None => format!("repeatable migration \"{description}\""),
    }
}

/// Compute the checksum of migration content.
///
/// A leading byte-order mark is ignored and line endings are normalised, so
/// the same script checked out on different platforms has the same checksum.
pub fn checksum(content: &str) -> i32 {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut hasher = Sha256::new();
    for line in content.lines() {
        hasher.update(line.trim_end_matches('\r').as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Result of parsing a migration resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Description with `_` replaced by spaces.
    pub description: String,
    /// Whether the name used the baseline prefix.
    pub baseline: bool,
}

/// Naming grammar: `<Prefix><Version><Sep><Description><Suffix>` for versioned
/// migrations and `<RepeatablePrefix><Sep><Description><Suffix>` for repeatable ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationNaming {
    /// Prefix of versioned migrations.
    pub prefix: String,
    /// Prefix of repeatable migrations.
    pub repeatable_prefix: String,
    /// Prefix of baseline migrations.
    pub baseline_prefix: String,
    /// Separator between version and description.
    pub separator: String,
    /// Accepted suffixes; empty means any suffix (used for code migrations).
    pub suffixes: Vec<String>,
}

impl Default for MigrationNaming {
    fn default() -> Self {
        Self {
            prefix: "V".to_string(),
            repeatable_prefix: "R".to_string(),
            baseline_prefix: "B".to_string(),
            separator: "__".to_string(),
            suffixes: vec![".sql".to_string()],
        }
    }
}

impl MigrationNaming {
    /// Strip a configured suffix, if any matches.
    pub fn strip_suffix<'a>(&self, name: &'a str) -> Option<&'a str> {
        if self.suffixes.is_empty() {
            return Some(name);
        }
        self.suffixes.iter().find_map(|s| name.strip_suffix(s.as_str()))
    }

    /// Whether `name` looks like a migration under this grammar.
    pub fn matches(&self, name: &str) -> bool {
        self.strip_suffix(name).is_some_and(|stem| {
            [&self.prefix, &self.repeatable_prefix, &self.baseline_prefix]
                .iter()
                .any(|p| !p.is_empty() && stem.starts_with(p.as_str()))
        })
    }

    /// Parse a resource name (file name or code unit name).
    pub fn parse(&self, name: &str) -> MigrateResult<ParsedName> {
        let stem = self.strip_suffix(name).ok_or_else(|| {
            MigrationError::invalid_name(
                name,
                format!("expected one of the suffixes {:?}", self.suffixes),
            )
        })?;

        let repeatable_marker = format!("{}{}", self.repeatable_prefix, self.separator);
        if let Some(desc) = stem.strip_prefix(&repeatable_marker) {
            return Ok(ParsedName {
                version: None,
                description: to_description(desc),
                baseline: false,
            });
        }

        let (rest, baseline) = if let Some(rest) = stem.strip_prefix(self.prefix.as_str()) {
            (rest, false)
        } else if let Some(rest) = stem.strip_prefix(self.baseline_prefix.as_str()) {
            (rest, true)
        } else {
            return Err(MigrationError::invalid_name(
                name,
                format!(
                    "expected prefix '{}', '{}' or '{}'",
                    self.prefix, self.baseline_prefix, repeatable_marker
                ),
            ));
        };

        let (version_text, desc) = match rest.split_once(self.separator.as_str()) {
            Some((v, d)) => (v, d),
            None => (rest, ""),
        };
        if version_text.is_empty() {
            return Err(MigrationError::invalid_name(name, "missing version"));
        }
        let version = Version::parse(version_text)
            .map_err(|e| MigrationError::invalid_name(name, e.to_string()))?;

        Ok(ParsedName {
            version: Some(version),
            description: to_description(desc),
            baseline,
        })
    }
}

fn to_description(raw: &str) -> String {
    raw.replace('_', " ").trim().to_string()
}
