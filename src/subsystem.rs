//! Subsystem entry points.
//!
//! The launch orchestrator talks to the database tier through this module:
//! a read-only readiness report before committing to launch, an idempotent
//! launch that opens one Lead queue per enabled database, and a graceful
//! shutdown. The dependency-graph service the server runs is external; this
//! module only declares what the database tier depends on.

use crate::config::DatabasesConfig;
use crate::engine::EngineRegistry;
use crate::error::{DbError, DbResult};
use crate::migrate::{self, MigrationCatalog, MigrationSource};
use crate::queue::{LeadQueue, QueueStats};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Subsystems the database tier depends on, for registration with the
/// server's dependency graph.
pub fn subsystem_dependencies() -> &'static [&'static str] {
    &["registry", "thread-pool", "network"]
}

/// Outcome of the pre-launch readiness check: an overall verdict plus one
/// human-readable line per validation step, so a missing native library or
/// a bad connection string is diagnosable without a debugger.
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub ready: bool,
    pub lines: Vec<String>,
}

impl std::fmt::Display for ReadinessReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        write!(
            f,
            "database subsystem: {}",
            if self.ready { "ready" } else { "not ready" }
        )
    }
}

/// The database tier: engine registry, migration catalog, and one Lead
/// queue per enabled configured database.
pub struct DatabaseSubsystem {
    config: Arc<DatabasesConfig>,
    registry: Arc<EngineRegistry>,
    catalog: Arc<MigrationCatalog>,
    queues: RwLock<HashMap<String, Arc<LeadQueue>>>,
    launched: AtomicBool,
}

impl DatabaseSubsystem {
    /// Build with the four stock engines and an empty embedded catalog.
    pub fn new(config: DatabasesConfig) -> DbResult<Self> {
        Self::with_catalog(config, MigrationCatalog::new())
    }

    /// Build with an embedded migration catalog.
    pub fn with_catalog(config: DatabasesConfig, catalog: MigrationCatalog) -> DbResult<Self> {
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(EngineRegistry::with_default_engines()?),
            catalog: Arc::new(catalog),
            queues: RwLock::new(HashMap::new()),
            launched: AtomicBool::new(false),
        })
    }

    /// Pure read-only pre-launch report: configuration shape, native-library
    /// loadability for every engine actually configured (without
    /// connecting), and migration-source discoverability.
    pub fn check_launch_readiness(&self) -> ReadinessReport {
        let mut lines = Vec::new();
        let mut ready = true;

        let enabled: Vec<_> = self.config.enabled_databases().collect();
        if enabled.is_empty() {
            lines.push("[fail] no enabled databases configured".to_string());
            return ReadinessReport {
                ready: false,
                lines,
            };
        }

        if let Err(problems) = self.config.validate() {
            for problem in problems {
                lines.push(format!("[fail] configuration: {problem}"));
            }
            ready = false;
        }

        for entry in enabled {
            lines.push(format!(
                "database '{}': engine {}",
                entry.name, entry.engine
            ));

            match self.registry.get(entry.engine) {
                Ok(engine) => {
                    match engine.probe_library() {
                        Ok(()) => {
                            lines.push(format!("  [ok] {} client library loadable", entry.engine));
                        }
                        Err(reason) => {
                            lines.push(format!(
                                "  [fail] {} client library: {reason}",
                                entry.engine
                            ));
                            ready = false;
                        }
                    }
                    if let Some(raw) = entry.connection_string.as_deref() {
                        match engine.validate_connection_string(raw) {
                            Ok(()) => {
                                lines.push("  [ok] connection string well-formed".to_string());
                            }
                            Err(e) => {
                                lines.push(format!("  [fail] connection string: {e}"));
                                ready = false;
                            }
                        }
                    }
                }
                Err(e) => {
                    lines.push(format!("  [fail] engine: {e}"));
                    ready = false;
                }
            }

            if entry.auto_migration {
                if let Some(configured) = entry.migration_source.as_deref() {
                    let source = MigrationSource::parse(configured);
                    match migrate::validate_source(&source, &self.catalog) {
                        Ok(lowest) => {
                            lines.push(format!(
                                "  [ok] migration source {source} (first script {lowest})"
                            ));
                        }
                        Err(reason) => {
                            lines.push(format!("  [fail] migration source: {reason}"));
                            ready = false;
                        }
                    }
                } else {
                    lines.push("  [fail] auto_migration without migration_source".to_string());
                    ready = false;
                }
            }
        }

        ReadinessReport { ready, lines }
    }

    /// Launch the subsystem: one Lead queue per enabled database, each
    /// making its first connection attempt synchronously. Idempotent -
    /// calling again after a launch is a no-op. Fails if the configuration
    /// is unusable or zero databases connect; queues that failed to connect
    /// keep retrying from their heartbeat either way.
    pub async fn launch(&self) -> DbResult<()> {
        if self.launched.swap(true, Ordering::AcqRel) {
            info!("Database subsystem already launched");
            return Ok(());
        }

        let enabled: Vec<_> = self.config.enabled_databases().cloned().collect();
        if enabled.is_empty() {
            // Nothing was started; don't latch the launched flag
            self.launched.store(false, Ordering::Release);
            return Err(DbError::configuration("no enabled databases configured"));
        }

        info!(count = enabled.len(), "Launching database subsystem");

        let mut connected = 0usize;
        for entry in enabled {
            let engine = match self.registry.get(entry.engine) {
                Ok(engine) => engine,
                Err(e) => {
                    error!(database = %entry.name, error = %e, "No adapter for engine");
                    continue;
                }
            };
            let queue = LeadQueue::new(entry, engine, Arc::clone(&self.catalog));
            if queue.start().await {
                connected += 1;
            }
            let mut queues = self.queues.write().await;
            queues.insert(queue.database_name().to_string(), queue);
        }

        if connected == 0 {
            warn!("Database subsystem launched with zero connected databases");
            return Err(DbError::configuration(
                "no configured database could be connected",
            ));
        }
        info!(connected, "Database subsystem launched");
        Ok(())
    }

    /// Look up the Lead queue for a database.
    pub async fn queue(&self, database: &str) -> DbResult<Arc<LeadQueue>> {
        let queues = self.queues.read().await;
        queues
            .get(database)
            .cloned()
            .ok_or_else(|| DbError::queue_unavailable(database, "no queue for this database"))
    }

    /// Snapshot every queue.
    pub async fn stats(&self) -> Vec<QueueStats> {
        let queues = {
            let guard = self.queues.read().await;
            guard.values().cloned().collect::<Vec<_>>()
        };
        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            stats.push(queue.stats().await);
        }
        stats.sort_by(|a, b| a.database.cmp(&b.database));
        stats
    }

    /// Stop every queue and close every connection.
    pub async fn shutdown(&self) {
        let queues = {
            let mut guard = self.queues.write().await;
            guard.drain().map(|(_, q)| q).collect::<Vec<_>>()
        };
        for queue in queues {
            queue.shutdown().await;
        }
        info!("Database subsystem stopped");
    }
}

impl std::fmt::Debug for DatabaseSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSubsystem")
            .field("launched", &self.launched.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseEntry;
    use crate::models::EngineKind;

    fn sqlite_config() -> DatabasesConfig {
        let mut entry = DatabaseEntry::new("jobs", EngineKind::SQLite);
        entry.database = Some(":memory:".to_string());
        DatabasesConfig {
            databases: vec![entry],
        }
    }

    #[test]
    fn test_dependencies_are_declared() {
        let deps = subsystem_dependencies();
        assert!(deps.contains(&"registry"));
        assert!(deps.contains(&"thread-pool"));
        assert!(deps.contains(&"network"));
    }

    #[test]
    fn test_readiness_empty_config() {
        let subsystem = DatabaseSubsystem::new(DatabasesConfig::default()).unwrap();
        let report = subsystem.check_launch_readiness();
        assert!(!report.ready);
        assert!(report.lines[0].contains("no enabled databases"));
    }

    #[test]
    fn test_readiness_sqlite_ok() {
        let subsystem = DatabaseSubsystem::new(sqlite_config()).unwrap();
        let report = subsystem.check_launch_readiness();
        assert!(report.ready, "{report}");
        assert!(report.lines.iter().any(|l| l.contains("client library")));
    }

    #[tokio::test]
    async fn test_launch_is_idempotent() {
        let subsystem = DatabaseSubsystem::new(sqlite_config()).unwrap();
        subsystem.launch().await.unwrap();
        // Second launch is a no-op, not a double start
        subsystem.launch().await.unwrap();
        let stats = subsystem.stats().await;
        assert_eq!(stats.len(), 1);
        assert!(stats[0].is_connected);
        subsystem.shutdown().await;
    }

    #[tokio::test]
    async fn test_launch_with_no_databases_fails() {
        let subsystem = DatabaseSubsystem::new(DatabasesConfig::default()).unwrap();
        assert!(subsystem.launch().await.is_err());
    }

    #[tokio::test]
    async fn test_queue_lookup() {
        let subsystem = DatabaseSubsystem::new(sqlite_config()).unwrap();
        subsystem.launch().await.unwrap();
        assert!(subsystem.queue("jobs").await.is_ok());
        assert!(subsystem.queue("nope").await.is_err());
        subsystem.shutdown().await;
    }
}
