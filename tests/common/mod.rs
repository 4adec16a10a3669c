//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use sluice::migrate::{LockConfig, MigrateConfig, MigrationEngine};
use sluice::sqlite::{SqliteConfig, SqliteDatabase};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Install a test subscriber once, honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A migrations directory and a database file in one temporary directory.
pub struct Project {
    dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("migrations")).expect("migrations dir");
        Self { dir }
    }

    pub fn migrations(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("app.db")
    }

    /// Write (or overwrite) a migration script.
    pub fn write(&self, name: &str, sql: &str) -> &Self {
        write_file(&self.migrations().join(name), sql);
        self
    }

    pub fn config(&self) -> MigrateConfig {
        MigrateConfig::new()
            .location(self.migrations())
            .installed_by("integration")
            .lock(LockConfig::fast())
    }

    pub async fn open(&self) -> SqliteDatabase {
        SqliteDatabase::open(SqliteConfig::file(self.database_path()))
            .await
            .expect("open database")
    }

    /// Engine with its own connection to the project database.
    pub async fn engine(&self) -> MigrationEngine {
        self.engine_with(self.config()).await
    }

    pub async fn engine_with(&self, config: MigrateConfig) -> MigrationEngine {
        let db = self.open().await;
        let history = db.history(&config.lock);
        MigrationEngine::new(config, Arc::new(history), Arc::new(db))
    }
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dir");
    }
    std::fs::write(path, content).expect("write migration");
}
