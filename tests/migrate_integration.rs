//! End-to-end migration runs against SQLite.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Project;
use pretty_assertions::assert_eq;
use sluice::migrate::{
    CodeMigration, CodeMigrationProvider, DatabaseConnection, ErrorCode, LockConfig, MigrateResult, MigrationError,
    MigrationState, MigrationType, SchemaHistory, Version,
};
use sluice::sqlite::SqliteDatabase;

fn states(set: &sluice::MigrationInfoSet) -> Vec<(String, MigrationState)> {
    set.all()
        .iter()
        .map(|i| {
            let key = match i.version() {
                Some(v) => v.to_string(),
                None => i.description().to_string(),
            };
            (key, i.state())
        })
        .collect()
}

async fn count(db: &SqliteDatabase, sql: &str) -> i64 {
    db.query_i64(sql).await.unwrap()
}

#[tokio::test]
async fn test_migrate_from_empty_schema() {
    let project = Project::new();
    project
        .write("V1__Create_person.sql", "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT);")
        .write("V1_1__Populate.sql", "INSERT INTO person (name) VALUES ('Axel'), ('Mr. Foo');")
        .write("R__person_view.sql", "DROP VIEW IF EXISTS person_names; CREATE VIEW person_names AS SELECT name FROM person;");

    let engine = project.engine().await;
    let result = engine.migrate().await.unwrap();
    assert_eq!(result.applied, 3);
    assert!(result.done);
    assert_eq!(result.initial_version, None);
    assert_eq!(result.target_version, Some(Version::parse("1.1").unwrap()));

    let info = engine.info().await.unwrap();
    assert_eq!(
        states(&info),
        vec![
            ("1".to_string(), MigrationState::Success),
            ("1.1".to_string(), MigrationState::Success),
            ("person view".to_string(), MigrationState::Success),
        ]
    );

    let rows = engine.history().all_applied().await.unwrap();
    let ranks: Vec<i32> = rows.iter().map(|r| r.installed_rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(rows.iter().all(|r| r.installed_by == "integration" && r.success));

    let db = project.open().await;
    assert_eq!(count(&db, "SELECT COUNT(*) FROM person_names").await, 2);

    let again = engine.migrate().await.unwrap();
    assert_eq!(again.applied, 0);
    assert!(!again.has_changes());
}

#[tokio::test]
async fn test_info_is_idempotent() {
    let project = Project::new();
    project
        .write("V1__One.sql", "CREATE TABLE one (id INTEGER);")
        .write("V2__Two.sql", "CREATE TABLE two (id INTEGER);");
    let engine = project.engine().await;
    engine.migrate().await.unwrap();
    project.write("V3__Three.sql", "CREATE TABLE three (id INTEGER);");

    let first = states(&engine.info().await.unwrap());
    let second = states(&engine.info().await.unwrap());
    assert_eq!(first, second);
    assert_eq!(first.last(), Some(&("3".to_string(), MigrationState::Pending)));
    assert_eq!(engine.history().all_applied().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_migrate_applies_once() {
    let project = Project::new();
    project
        .write("V1__Create.sql", "CREATE TABLE t (id INTEGER PRIMARY KEY);")
        .write("V2__Seed.sql", "INSERT INTO t (id) VALUES (1);");

    let first = project.engine().await;
    let second = project.engine().await;
    let (a, b) = tokio::join!(first.migrate(), second.migrate());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.applied + b.applied, 2);
    assert!(a.done && b.done);

    let rows = first.history().all_applied().await.unwrap();
    assert_eq!(rows.len(), 2);
    let db = project.open().await;
    assert_eq!(count(&db, "SELECT COUNT(*) FROM t").await, 1);
}

#[tokio::test]
async fn test_checksum_drift_fails_validation() {
    let project = Project::new();
    project.write("V1__Create.sql", "CREATE TABLE t (id INTEGER);");
    let engine = project.engine().await;
    engine.migrate().await.unwrap();

    project
        .write("V1__Create.sql", "CREATE TABLE t (id INTEGER, name TEXT);")
        .write("V2__Next.sql", "CREATE TABLE u (id INTEGER);");

    let err = engine.migrate().await.unwrap_err();
    let MigrationError::Validation(result) = err else {
        panic!("expected a validation error, got {err}");
    };
    let mismatch = result.with_code(ErrorCode::ChecksumMismatch).next().unwrap();
    assert!(mismatch.message.starts_with("Migration checksum mismatch for migration version 1\n"));
    assert!(mismatch.message.contains("-> Applied to database : "));
    assert!(mismatch.message.contains("-> Resolved locally    : "));
    assert_eq!(engine.history().all_applied().await.unwrap().len(), 1);

    let repaired = engine.repair().await.unwrap();
    assert_eq!(repaired.aligned, 1);
    assert_eq!(engine.migrate().await.unwrap().applied, 1);
}

#[tokio::test]
async fn test_out_of_order() {
    let project = Project::new();
    project
        .write("V1__One.sql", "CREATE TABLE one (id INTEGER);")
        .write("V3__Three.sql", "CREATE TABLE three (id INTEGER);");
    project.engine().await.migrate().await.unwrap();
    project.write("V2__Two.sql", "CREATE TABLE two (id INTEGER);");

    let strict = project.engine().await;
    let info = strict.info().await.unwrap();
    assert!(states(&info).contains(&("2".to_string(), MigrationState::Ignored)));
    let err = strict.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::Validation(_)));

    let relaxed = project.engine_with(project.config().out_of_order(true)).await;
    let result = relaxed.migrate().await.unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.migrations[0].installed_rank, 3);

    let info = relaxed.info().await.unwrap();
    assert_eq!(
        states(&info),
        vec![
            ("1".to_string(), MigrationState::Success),
            ("3".to_string(), MigrationState::Success),
            ("2".to_string(), MigrationState::OutOfOrder),
        ]
    );
}

#[tokio::test]
async fn test_failed_non_transactional_migration_then_repair() {
    let project = Project::new();
    project
        .write("V1__One.sql", "CREATE TABLE one (id INTEGER);")
        .write("V2__Two.sql", "CREATE TABLE two (id INTEGER);")
        .write("V3__Three.sql", "CREATE TABLE three (id INTEGER);")
        .write(
            "V4__Broken.sql",
            "-- sluice:no-transaction\nCREATE TABLE four (id INTEGER);\nTHIS IS NOT SQL;",
        );

    let engine = project.engine().await;
    let err = engine.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::MigrationFailed { recorded: true, .. }));

    let rows = engine.history().all_applied().await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(!rows[3].success);
    let failed_rank = rows[3].installed_rank;
    let info = engine.info().await.unwrap();
    assert_eq!(info.failed().len(), 1);

    assert!(engine.migrate().await.is_err());

    let repaired = engine.repair().await.unwrap();
    assert_eq!(repaired.removed, 1);
    assert_eq!(engine.history().all_applied().await.unwrap().len(), 3);

    project.write(
        "V4__Broken.sql",
        "-- sluice:no-transaction\nCREATE TABLE IF NOT EXISTS four (id INTEGER);",
    );
    let result = engine.migrate().await.unwrap();
    assert_eq!(result.applied, 1);
    assert!(result.migrations[0].installed_rank > failed_rank);
    let ranks: Vec<i32> = engine
        .history()
        .all_applied()
        .await
        .unwrap()
        .iter()
        .map(|r| r.installed_rank)
        .collect();
    assert_eq!(ranks, vec![1, 2, 3, 5]);
}

#[tokio::test]
async fn test_transactional_failure_leaves_nothing() {
    let project = Project::new();
    project
        .write("V1__One.sql", "CREATE TABLE one (id INTEGER);")
        .write("V2__Broken.sql", "CREATE TABLE two (id INTEGER);\nTHIS IS NOT SQL;");

    let engine = project.engine().await;
    let err = engine.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::MigrationFailed { recorded: false, .. }));
    assert!(err.to_string().contains("V2__Broken.sql"));

    assert_eq!(engine.history().all_applied().await.unwrap().len(), 1);
    let db = project.open().await;
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'two'").await,
        0
    );
}

#[tokio::test]
async fn test_baseline_on_migrate_for_existing_schema() {
    let project = Project::new();
    let db = project.open().await;
    db.execute_batch("CREATE TABLE legacy (id INTEGER);").await.unwrap();

    project
        .write("V1__Legacy.sql", "CREATE TABLE legacy (id INTEGER);")
        .write("V2__Next.sql", "CREATE TABLE next (id INTEGER);");

    let err = project.engine().await.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::Config(_)));

    let engine = project.engine_with(project.config().baseline_on_migrate(true)).await;
    let result = engine.migrate().await.unwrap();
    assert!(result.baselined);
    assert_eq!(result.applied, 1);

    let rows = engine.history().all_applied().await.unwrap();
    assert_eq!(rows[0].migration_type, MigrationType::Baseline);
    assert_eq!(rows[1].description, "Next");
}

#[tokio::test]
async fn test_target_version() {
    let project = Project::new();
    project
        .write("V1__One.sql", "CREATE TABLE one (id INTEGER);")
        .write("V2__Two.sql", "CREATE TABLE two (id INTEGER);");

    let limited = project
        .engine_with(project.config().target(Version::parse("1").unwrap()))
        .await;
    assert_eq!(limited.migrate().await.unwrap().applied, 1);
    let info = limited.info().await.unwrap();
    assert!(states(&info).contains(&("2".to_string(), MigrationState::AboveTarget)));

    let missing = project
        .engine_with(project.config().target(Version::parse("7").unwrap()))
        .await;
    assert!(matches!(
        missing.migrate().await.unwrap_err(),
        MigrationError::MissingTarget(_)
    ));
}

struct SeedPeople;

#[async_trait::async_trait]
impl CodeMigration for SeedPeople {
    fn name(&self) -> &str {
        "V2__Seed_people"
    }

    async fn migrate(&self, connection: &dyn DatabaseConnection) -> MigrateResult<()> {
        connection
            .execute_batch("INSERT INTO person (name) VALUES ('code');")
            .await
    }
}

#[tokio::test]
async fn test_code_and_sql_migrations_interleave() {
    let project = Project::new();
    project
        .write("V1__Create.sql", "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT);")
        .write("V3__Index.sql", "CREATE INDEX person_name ON person (name);");

    let engine = project
        .engine()
        .await
        .with_provider(Arc::new(CodeMigrationProvider::new().with_migration(SeedPeople)));
    let result = engine.migrate().await.unwrap();
    let order: Vec<_> = result
        .migrations
        .iter()
        .map(|m| (m.description.clone(), m.migration_type))
        .collect();
    assert_eq!(
        order,
        vec![
            ("Create".to_string(), MigrationType::Sql),
            ("Seed people".to_string(), MigrationType::Code),
            ("Index".to_string(), MigrationType::Sql),
        ]
    );

    let db = project.open().await;
    assert_eq!(count(&db, "SELECT COUNT(*) FROM person").await, 1);
}

#[tokio::test]
async fn test_sql_callbacks_from_locations() {
    let project = Project::new();
    project
        .write("V1__Create.sql", "CREATE TABLE audit (event TEXT);")
        .write("afterEachMigrate__audit.sql", "INSERT INTO audit VALUES ('applied');")
        .write("afterMigrate.sql", "INSERT INTO audit VALUES ('done');");

    let engine = project.engine().await;
    let result = engine.migrate().await.unwrap();
    assert_eq!(result.applied, 1);

    let db = project.open().await;
    assert_eq!(count(&db, "SELECT COUNT(*) FROM audit").await, 2);
}

struct SlowTable;

#[async_trait::async_trait]
impl CodeMigration for SlowTable {
    fn name(&self) -> &str {
        "V2__Slow_table"
    }

    async fn migrate(&self, connection: &dyn DatabaseConnection) -> MigrateResult<()> {
        connection.execute_batch("CREATE TABLE slow (id INTEGER);").await?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_dropped_run_releases_lock() {
    let project = Project::new();
    project.write("V1__Create.sql", "CREATE TABLE t (id INTEGER);");

    let engine = project
        .engine()
        .await
        .with_provider(Arc::new(CodeMigrationProvider::new().with_migration(SlowTable)));
    let outcome = tokio::time::timeout(Duration::from_millis(200), engine.migrate()).await;
    assert!(outcome.is_err());
    drop(engine);

    let next = project
        .engine_with(project.config().lock(LockConfig::fast().retries(20)))
        .await;
    let result = next.migrate().await.unwrap();
    assert_eq!(result.applied, 0);

    let rows = next.history().all_applied().await.unwrap();
    assert_eq!(rows.len(), 1);
    let db = project.open().await;
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'slow'").await,
        0
    );
}
