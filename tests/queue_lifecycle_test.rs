//! Integration tests for Lead-queue lifecycle and launch behavior.

use dbtier::config::{DatabaseEntry, DatabasesConfig};
use dbtier::models::EngineKind;
use dbtier::subsystem::DatabaseSubsystem;
use std::time::Duration;

fn sqlite_entry(name: &str) -> DatabaseEntry {
    let mut entry = DatabaseEntry::new(name, EngineKind::SQLite);
    entry.database = Some(":memory:".to_string());
    entry
}

/// An unreachable PostgreSQL host: the readiness check still reports the
/// driver loadable, launch fails gracefully, and the queue stays degraded
/// with its heartbeat retrying - the process never crashes.
#[tokio::test]
async fn test_unreachable_postgres_degrades_gracefully() {
    let mut entry = DatabaseEntry::new("audit", EngineKind::PostgreSQL);
    // Port 9 (discard) on localhost: connection refused, quickly
    entry.connection_string = Some("postgresql://svc:pw@127.0.0.1:9/audit".to_string());
    entry.connect_timeout_secs = Some(2);
    entry.heartbeat_interval_secs = Some(1);
    let config = DatabasesConfig {
        databases: vec![entry],
    };

    let subsystem = DatabaseSubsystem::new(config).unwrap();

    let report = subsystem.check_launch_readiness();
    assert!(report.ready, "{report}");
    assert!(
        report
            .lines
            .iter()
            .any(|l| l.contains("PostgreSQL client library loadable")),
        "{report}"
    );

    // Zero databases connected: launch reports failure...
    assert!(subsystem.launch().await.is_err());

    // ...but the queue exists, is not connected, and keeps retrying
    let queue = subsystem.queue("audit").await.unwrap();
    assert!(!queue.is_connected());
    assert!(
        queue
            .wait_for_initial_connection(Duration::from_millis(10))
            .await
    );

    let attempts_before = subsystem.stats().await[0].reconnect_attempts;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let attempts_after = subsystem.stats().await[0].reconnect_attempts;
    assert!(
        attempts_after > attempts_before,
        "heartbeat should keep retrying ({attempts_before} -> {attempts_after})"
    );

    subsystem.shutdown().await;
}

/// Disabled databases get no queue.
#[tokio::test]
async fn test_disabled_database_is_skipped() {
    let mut disabled = sqlite_entry("shadow");
    disabled.enabled = false;
    let config = DatabasesConfig {
        databases: vec![sqlite_entry("jobs"), disabled],
    };
    let subsystem = DatabaseSubsystem::new(config).unwrap();
    subsystem.launch().await.unwrap();

    assert!(subsystem.queue("jobs").await.is_ok());
    assert!(subsystem.queue("shadow").await.is_err());
    subsystem.shutdown().await;
}

/// One failing database does not take down a healthy one.
#[tokio::test]
async fn test_mixed_health_still_launches() {
    let mut bad = DatabaseEntry::new("audit", EngineKind::PostgreSQL);
    bad.connection_string = Some("postgresql://svc:pw@127.0.0.1:9/audit".to_string());
    bad.connect_timeout_secs = Some(2);
    let config = DatabasesConfig {
        databases: vec![sqlite_entry("jobs"), bad],
    };
    let subsystem = DatabaseSubsystem::new(config).unwrap();

    // One of two connected: launch succeeds
    subsystem.launch().await.unwrap();

    let stats = subsystem.stats().await;
    assert_eq!(stats.len(), 2);
    let jobs = stats.iter().find(|s| s.database == "jobs").unwrap();
    let audit = stats.iter().find(|s| s.database == "audit").unwrap();
    assert!(jobs.is_connected);
    assert!(!audit.is_connected);
    assert_eq!(audit.state, "degraded");

    subsystem.shutdown().await;
}
