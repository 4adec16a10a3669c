//! # sluice-migrate
//!
//! Versioned schema migration engine.
//!
//! This crate provides functionality for:
//! - Discovering migrations from SQL files and code providers
//! - Reconciling them with the schema history table
//! - Validating checksums, descriptions and types against the history
//! - Applying pending migrations under a cross-process lock
//! - Repairing and baselining the history
//! - Lifecycle callbacks, in code or as SQL scripts
//!
//! ## Architecture
//!
//! Every operation resolves migrations, reads the history and reconciles the
//! two into a [`MigrationInfoSet`]. Migrate does this again once it holds the
//! lock, so concurrent runs never apply the same migration twice.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ SQL files    │────▶│   Composite    │────▶│  Reconcile   │
//! │ Code         │     │   Resolver     │     │  (info set)  │
//! └──────────────┘     └────────────────┘     └──────────────┘
//!                                                    ▲  │
//!                      ┌────────────────┐            │  ▼
//!                      │ Schema History │────────────┘ ┌──────────────┐
//!                      │    + Lock      │◀─────────────│   Migrator   │
//!                      └────────────────┘   record     └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sluice_migrate::{MigrateConfig, MigrationEngine};
//!
//! async fn run_migrations() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrateConfig::load(std::path::Path::new("sluice.toml"))?;
//!
//!     let history = /* a SchemaHistory implementation */;
//!     let connection = /* a DatabaseConnection implementation */;
//!     let engine = MigrationEngine::new(config, Arc::new(history), Arc::new(connection));
//!
//!     let result = engine.migrate().await?;
//!     println!("{}", result.summary());
//!
//!     for info in engine.info().await?.all() {
//!         println!("{:?} {} {}", info.version(), info.description(), info.state().display_name());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! ```text
//! migrations/
//! ├── V1__create_users.sql
//! ├── V1_1__add_email_index.sql
//! ├── B5__baseline_from_prod.sql     # baseline script
//! ├── R__user_views.sql              # repeatable, re-run when changed
//! ├── afterMigrate__analyze.sql      # callback
//! └── reporting/
//!     └── V6__reporting_schema.sql
//! ```

pub mod callback;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod file;
pub mod history;
pub mod info;
pub mod lock;
pub mod migrate;
pub mod migration;
pub mod resolver;
pub mod validate;
pub mod version;

#[cfg(test)]
mod test_support;

// Re-exports
pub use callback::{Callback, CallbackContext, CallbackExecutor, Event, SqlCallback};
pub use config::{LockConfig, MigrateConfig};
pub use connection::DatabaseConnection;
pub use engine::{BaselineResult, MigrationEngine, RepairResult};
pub use error::{MigrateResult, MigrationError};
pub use file::{NO_TRANSACTION_DIRECTIVE, SqlFileProvider, SqlScriptExecutor};
pub use history::{AppliedMigration, AppliedMigrationDraft, InMemorySchemaHistory, SchemaHistory};
pub use info::{MigrationInfo, MigrationInfoSet, MigrationState, ReconcileOptions, reconcile};
pub use lock::{InMemoryLock, LockCoordinator, LockGuard, LockPrimitive, RetryStrategy};
pub use migrate::{MigrateOutput, MigrationBatchResult, Migrator};
pub use migration::{MigrationExecutor, MigrationNaming, MigrationType, NaturalKey, ResolvedMigration};
pub use resolver::{
    CodeMigration, CodeMigrationInfo, CodeMigrationProvider, CompositeResolver, MigrationProvider, ProviderKind,
};
pub use validate::{ErrorCode, ValidatePattern, ValidationError, ValidationResult};
pub use version::Version;
