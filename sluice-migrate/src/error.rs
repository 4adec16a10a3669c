//! Error types for the migration engine.

use thiserror::Error;

use crate::validate::ValidationResult;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration could not be read or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A version string could not be parsed.
    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The offending text.
        version: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A migration resource name does not follow the naming grammar.
    #[error("Invalid migration name '{name}': {reason}")]
    InvalidMigrationName {
        /// The offending resource name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two resolved migrations share the same natural key.
    #[error("Found more than one migration with {key}\nOffenders:\n-> {first}\n-> {second}")]
    DuplicateMigration {
        /// Natural key description, e.g. `version 1.1`.
        key: String,
        /// Physical location of the first offender.
        first: String,
        /// Physical location of the second offender.
        second: String,
    },

    /// Applied migrations do not match resolved migrations.
    #[error("Validate failed: {0}")]
    Validation(ValidationResult),

    /// A migration failed while executing.
    #[error("Migration of {migration} failed{}: {source}", outcome_suffix(.recorded))]
    MigrationFailed {
        /// Human readable identity of the migration.
        migration: String,
        /// Whether a failed row was written to the schema history.
        recorded: bool,
        /// Underlying cause.
        #[source]
        source: Box<MigrationError>,
    },

    /// The schema history contains a failed migration.
    #[error("Schema history contains a failed migration {0}. Run repair to remove it.")]
    FailedMigrationInHistory(String),

    /// The configured target version does not exist.
    #[error("No migration with target version {0} could be found")]
    MissingTarget(String),

    /// Lock retries were exhausted.
    #[error("Unable to acquire the schema history lock after {attempts} attempts")]
    LockTimeout {
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// Waiting for the lock was interrupted.
    #[error("Interrupted while waiting for the schema history lock")]
    LockInterrupted,

    /// A callback aborted the operation.
    #[error("Callback '{callback}' failed on {event}: {message}")]
    Callback {
        /// Callback name.
        callback: String,
        /// Event being handled.
        event: String,
        /// Failure message.
        message: String,
    },

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

fn outcome_suffix(recorded: &bool) -> &'static str {
    if *recorded {
        " (recorded as failed)"
    } else {
        " (rolled back)"
    }
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid version error.
    pub fn invalid_version(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVersion {
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid migration name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMigrationName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error is a descriptor-format problem of a single resource.
    pub fn is_descriptor_format(&self) -> bool {
        matches!(
            self,
            Self::InvalidVersion { .. } | Self::InvalidMigrationName { .. }
        )
    }

    /// Check if this is a recoverable error.
    ///
    /// Lock contention resolves itself once the holder finishes; everything
    /// else needs an operator.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
