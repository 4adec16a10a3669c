//! # Sluice
//!
//! Versioned database schema migrations.
//!
//! Sluice provides:
//! - Versioned, repeatable and baseline SQL migrations discovered from disk
//! - Migrations written in Rust through [`CodeMigration`]
//! - Checksum, description and type validation against the schema history
//! - Exactly-once application across concurrently starting processes
//! - Repair and baseline of existing schemas
//! - Lifecycle callbacks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sluice::prelude::*;
//! use sluice::sqlite::{SqliteConfig, SqliteDatabase};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = SqliteDatabase::open(SqliteConfig::file("app.db")).await?;
//!     let config = MigrateConfig::load(std::path::Path::new("sluice.toml"))?;
//!     let history = db.history(&config.lock);
//!
//!     let engine = MigrationEngine::new(config, Arc::new(history), Arc::new(db));
//!     let result = engine.migrate().await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The migration engine.
pub mod migrate {
    pub use sluice_migrate::*;
}

/// SQLite history, lock and connection.
#[cfg(feature = "sqlite")]
pub mod sqlite {
    pub use sluice_sqlite::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use sluice_migrate::{
        Callback, CallbackContext, CodeMigration, CodeMigrationInfo, CodeMigrationProvider, DatabaseConnection,
        Event, MigrateConfig, MigrateResult, MigrationEngine, MigrationError, MigrationState, SchemaHistory,
        ValidatePattern, Version,
    };
}

// Re-export key types at the crate root
pub use sluice_migrate::{
    CodeMigration, MigrateConfig, MigrateResult, MigrationBatchResult, MigrationEngine, MigrationError,
    MigrationInfoSet, MigrationState, ValidationResult, Version,
};
