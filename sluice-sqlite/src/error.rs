//! Error types for SQLite operations.

use sluice_migrate::MigrationError;
use thiserror::Error;

/// Result type for SQLite operations.
pub type SqliteResult<T> = Result<T, SqliteError>;

/// Error type for SQLite operations.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// SQLite driver error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A history row could not be decoded.
    #[error("Invalid schema history row {rank}: {message}")]
    InvalidRow {
        /// Installed rank of the row.
        rank: i32,
        /// What was wrong with it.
        message: String,
    },
}

impl SqliteError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a row decoding error.
    pub fn invalid_row(rank: i32, msg: impl Into<String>) -> Self {
        Self::InvalidRow {
            rank,
            message: msg.into(),
        }
    }

    /// Whether SQLite reported the database as busy or locked.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(tokio_rusqlite::Error::Rusqlite(e)) => is_busy(e),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sqlite(tokio_rusqlite::Error::Rusqlite(err))
    }
}

impl From<SqliteError> for MigrationError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Config(msg) => MigrationError::Config(msg),
            other => MigrationError::database(other.to_string()),
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}
