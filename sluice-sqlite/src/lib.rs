//! SQLite backend for sluice.
//!
//! This crate provides the durable collaborators of the migration engine,
//! using `tokio-rusqlite` for asynchronous database operations.
//!
//! # Features
//!
//! - Schema history table whose installed ranks are never reused
//! - Sentinel-row lock with heartbeat and expiry of abandoned locks
//! - Transactional DDL: a failed migration leaves neither changes nor a history row
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sluice_migrate::{MigrateConfig, MigrationEngine};
//! use sluice_sqlite::{SqliteConfig, SqliteDatabase};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = SqliteDatabase::open(SqliteConfig::from_url("sqlite://./app.db")?).await?;
//!     let config = MigrateConfig::new().location("./migrations");
//!     let history = db.history(&config.lock);
//!
//!     let engine = MigrationEngine::new(config, Arc::new(history), Arc::new(db));
//!     println!("{}", engine.migrate().await?.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod lock;

pub use config::{DatabasePath, JournalMode, SqliteConfig};
pub use connection::SqliteDatabase;
pub use error::{SqliteError, SqliteResult};
pub use history::SqliteSchemaHistory;
pub use lock::SqliteLock;
