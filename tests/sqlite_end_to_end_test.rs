//! End-to-end: launch, bootstrap, migrate, and query one SQLite database.

use dbtier::config::{DatabaseEntry, DatabasesConfig};
use dbtier::models::{EngineKind, QueryRequest};
use dbtier::subsystem::DatabaseSubsystem;
use std::time::Duration;

/// Launching a SQLite database with auto_migration and two single-statement
/// scripts must connect, pass bootstrap, apply both scripts in order, and
/// leave both tables present.
#[tokio::test]
async fn test_sqlite_launch_bootstrap_and_migrate() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("m_00001.lua"),
        "CREATE TABLE IF NOT EXISTS print_jobs (id INTEGER PRIMARY KEY, device TEXT)",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("m_00002.lua"),
        "CREATE TABLE IF NOT EXISTS device_state (id INTEGER PRIMARY KEY, seen_at TEXT)",
    )
    .unwrap();

    let mut entry = DatabaseEntry::new("devices", EngineKind::SQLite);
    entry.database = Some(":memory:".to_string());
    entry.auto_migration = true;
    entry.migration_source = Some(dir.path().to_string_lossy().to_string());
    let config = DatabasesConfig {
        databases: vec![entry],
    };

    let subsystem = DatabaseSubsystem::new(config).unwrap();
    let report = subsystem.check_launch_readiness();
    assert!(report.ready, "{report}");
    assert!(
        report.lines.iter().any(|l| l.contains("m_00001.lua")),
        "readiness should name the lowest-numbered script: {report}"
    );

    subsystem.launch().await.unwrap();

    let queue = subsystem.queue("devices").await.unwrap();
    assert!(queue.wait_for_initial_connection(Duration::from_secs(5)).await);
    assert!(queue.wait_for_bootstrap(Duration::from_secs(5)).await);
    assert!(queue.is_connected());

    let tables = queue
        .submit(QueryRequest::new(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        ))
        .await;
    assert!(tables.success, "{:?}", tables.error_message);
    let names: Vec<String> = tables
        .rows
        .iter()
        .filter_map(|r| r["name"].as_str().map(String::from))
        .collect();
    assert!(names.contains(&"print_jobs".to_string()), "{names:?}");
    assert!(names.contains(&"device_state".to_string()), "{names:?}");

    // The migrated schema is usable through the queue
    let insert = queue
        .submit(QueryRequest::new(
            "INSERT INTO print_jobs (device) VALUES ('front-desk')",
        ))
        .await;
    assert_eq!(insert.affected_rows, Some(1));

    let select = queue
        .submit(QueryRequest::new("SELECT id, device FROM print_jobs"))
        .await;
    assert!(select.success);
    assert_eq!(select.row_count, 1);
    assert_eq!(select.rows[0]["id"], serde_json::json!(1));
    assert_eq!(select.rows[0]["device"], serde_json::json!("front-desk"));

    subsystem.shutdown().await;
}

/// Bootstrap failure is logged, signaled, and non-fatal: the connection
/// survives and the queue keeps serving work.
#[tokio::test]
async fn test_failed_bootstrap_does_not_tear_down_connection() {
    let mut entry = DatabaseEntry::new("devices", EngineKind::SQLite);
    entry.database = Some(":memory:".to_string());
    entry.bootstrap_query = Some("SELECT * FROM table_that_does_not_exist".to_string());
    let config = DatabasesConfig {
        databases: vec![entry],
    };

    let subsystem = DatabaseSubsystem::new(config).unwrap();
    subsystem.launch().await.unwrap();

    let queue = subsystem.queue("devices").await.unwrap();
    // The bootstrap outcome (failure included) is still signaled
    assert!(queue.wait_for_bootstrap(Duration::from_secs(5)).await);
    assert!(queue.is_connected());

    let result = queue.submit(QueryRequest::new("SELECT 1 AS one")).await;
    assert!(result.success);
    assert_eq!(result.rows[0]["one"], serde_json::json!(1));

    subsystem.shutdown().await;
}
