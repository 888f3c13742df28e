//! Configuration for the database queue subsystem.
//!
//! The surrounding server validates and loads JSON configuration; this module
//! defines the deserialized shape the subsystem consumes. Configuration is
//! read-only after launch and may be shared freely across threads.

use crate::models::EngineKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_BOOTSTRAP_QUERY: &str = "SELECT 1";

// Queue tuning defaults
pub const DEFAULT_MAX_CHILD_QUEUES: usize = 4;
pub const DEFAULT_WORK_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_CHILD_IDLE_TIMEOUT_SECS: u64 = 60;

// Connection health defaults
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 32;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Per-database configuration entry.
///
/// Either `connection_string` or the structured host/port/database fields
/// may be given; an explicit raw string wins. SQLite with neither falls back
/// to `:memory:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    /// Logical database name; also the queue designator prefix.
    pub name: String,
    pub engine: EngineKind,
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Database name on the server (or file path for SQLite).
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Contains sensitive data - never log
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Raw engine connection string; takes precedence over structured fields.
    #[serde(default, skip_serializing)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub query_timeout_secs: Option<u64>,

    /// Run pending migration scripts after the first successful connection.
    #[serde(default)]
    pub auto_migration: bool,
    /// Migration source: `embedded:<prefix>` or a filesystem directory.
    #[serde(default)]
    pub migration_source: Option<String>,
    /// Apply migrations against a scratch copy first where supported.
    #[serde(default)]
    pub test_migration: bool,

    /// Canary query run once after the first successful connection.
    #[serde(default)]
    pub bootstrap_query: Option<String>,

    #[serde(default)]
    pub statement_cache_capacity: Option<usize>,
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_child_queues: Option<usize>,
    /// Consecutive health-check failures before the heartbeat escalates to
    /// reset/reconnect.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub child_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub work_queue_depth: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl DatabaseEntry {
    /// Minimal entry for a named database on the given engine.
    pub fn new(name: impl Into<String>, engine: EngineKind) -> Self {
        Self {
            name: name.into(),
            engine,
            enabled: true,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            connection_string: None,
            tls: false,
            connect_timeout_secs: None,
            query_timeout_secs: None,
            auto_migration: false,
            migration_source: None,
            test_migration: false,
            bootstrap_query: None,
            statement_cache_capacity: None,
            heartbeat_interval_secs: None,
            max_child_queues: None,
            failure_threshold: None,
            child_idle_timeout_secs: None,
            work_queue_depth: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_interval_secs
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        )
    }

    pub fn bootstrap_query_or_default(&self) -> &str {
        self.bootstrap_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(DEFAULT_BOOTSTRAP_QUERY)
    }

    pub fn statement_cache_capacity_or_default(&self) -> usize {
        self.statement_cache_capacity
            .unwrap_or(DEFAULT_STATEMENT_CACHE_CAPACITY)
    }

    pub fn max_child_queues_or_default(&self) -> usize {
        self.max_child_queues.unwrap_or(DEFAULT_MAX_CHILD_QUEUES)
    }

    pub fn failure_threshold_or_default(&self) -> u32 {
        self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn child_idle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.child_idle_timeout_secs
                .unwrap_or(DEFAULT_CHILD_IDLE_TIMEOUT_SECS),
        )
    }

    pub fn work_queue_depth_or_default(&self) -> usize {
        self.work_queue_depth.unwrap_or(DEFAULT_WORK_QUEUE_DEPTH)
    }

    /// Validate this entry and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("database name cannot be empty".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "database name contains invalid characters: {}",
                self.name
            ));
        }
        if let Some(raw) = &self.connection_string {
            if EngineKind::from_connection_string(raw)
                .is_some_and(|detected| detected != self.engine)
            {
                return Err(format!(
                    "connection string for '{}' does not match engine {}",
                    self.name, self.engine
                ));
            }
        } else if self.engine != EngineKind::SQLite
            && self.host.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(format!(
                "'{}' needs either a connection string or a host",
                self.name
            ));
        }
        if let Some(cap) = self.statement_cache_capacity {
            if cap == 0 {
                return Err("statement_cache_capacity must be greater than 0".to_string());
            }
        }
        if let Some(max) = self.max_child_queues {
            if max == 0 {
                return Err("max_child_queues must be greater than 0".to_string());
            }
        }
        if self.auto_migration && self.migration_source.as_deref().unwrap_or("").is_empty() {
            return Err(format!(
                "'{}' enables auto_migration without a migration_source",
                self.name
            ));
        }
        Ok(())
    }
}

/// Top-level subsystem configuration: the set of configured databases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabasesConfig {
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
}

impl DatabasesConfig {
    /// Parse from a JSON document (loading the file is the caller's concern).
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("invalid configuration JSON: {e}"))
    }

    /// Databases that are enabled for launch.
    pub fn enabled_databases(&self) -> impl Iterator<Item = &DatabaseEntry> {
        self.databases.iter().filter(|d| d.enabled)
    }

    /// Validate every entry; collects all problems rather than stopping at
    /// the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.databases.is_empty() {
            problems.push("no databases configured".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.databases {
            if let Err(e) = entry.validate() {
                problems.push(e);
            }
            if !seen.insert(entry.name.clone()) {
                problems.push(format!("duplicate database name: {}", entry.name));
            }
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }
}
