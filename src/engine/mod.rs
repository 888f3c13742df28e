//! Engine interface and adapter registry.
//!
//! Every database engine implements the [`Engine`] trait - the same fixed
//! operation set with an engine-specific body - and is registered with the
//! [`EngineRegistry`] under its [`EngineKind`]. The registry refuses adapters
//! whose descriptor is missing any mandatory operation, keeping the
//! "pluggable, centrally registered adapters" shape without reflection.
//!
//! Adapters:
//! - `postgres`, `mysql`, `sqlite`: statically linked sqlx drivers over a
//!   single dedicated connection object each
//! - `db2`: DB2 CLI resolved from a shared library at runtime

pub mod conn_string;
pub mod db2;
pub mod handle;
pub mod mysql;
pub mod postgres;
pub mod rows;
pub mod sqlite;

pub use conn_string::{ConnectParams, mask_connection_string};
pub use db2::Db2Engine;
pub use handle::{ActiveTransaction, ConnectionHandle, ConnectionStatus, StatementCache};
pub use mysql::MySqlEngine;
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

use crate::error::{DbError, DbResult};
use crate::models::{EngineKind, IsolationLevel, QueryRequest, QueryResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Timeout applied to transaction bookkeeping statements (BEGIN/COMMIT/
/// ROLLBACK), which should never run long.
pub const TRANSACTION_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied to health-check probes.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability table an adapter presents at registration time.
///
/// The first four entries are mandatory; an adapter missing any of them is
/// refused by the registry.
#[derive(Debug, Clone, Copy)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub provides_connect: bool,
    pub provides_disconnect: bool,
    pub provides_health_check: bool,
    pub provides_execute_query: bool,
    /// In-place connection recovery (ping/reset primitive).
    pub supports_reset: bool,
    pub supports_prepared_statements: bool,
    /// Driver exposes a lightweight ping distinct from running `SELECT 1`.
    pub supports_native_ping: bool,
    /// Whole migration scripts can run as one transactional unit.
    pub multi_statement_transactions: bool,
}

impl EngineDescriptor {
    /// Descriptor with all mandatory operations present.
    pub fn complete(kind: EngineKind) -> Self {
        Self {
            kind,
            provides_connect: true,
            provides_disconnect: true,
            provides_health_check: true,
            provides_execute_query: true,
            supports_reset: false,
            supports_prepared_statements: true,
            supports_native_ping: false,
            multi_statement_transactions: kind.supports_multi_statement_transactions(),
        }
    }

    /// Names of mandatory operations this descriptor does not provide.
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.provides_connect {
            missing.push("connect");
        }
        if !self.provides_disconnect {
            missing.push("disconnect");
        }
        if !self.provides_health_check {
            missing.push("health_check");
        }
        if !self.provides_execute_query {
            missing.push("execute_query");
        }
        missing
    }
}

/// The fixed operation set every engine adapter implements.
///
/// Operations that are pure bookkeeping around [`Engine::run_statement`]
/// (transactions, prepared-statement cache management) have default bodies;
/// adapters override them where the engine's semantics differ (DB2 drives
/// transactions through CLI attributes rather than SQL).
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor::complete(self.kind())
    }

    /// Check that the engine's native client library can be loaded, without
    /// connecting. The result is computed once and cached for the process
    /// lifetime; a missing library is a soft failure with a reason.
    fn probe_library(&self) -> Result<(), String>;

    /// Strict shape check for a raw connection string.
    fn validate_connection_string(&self, raw: &str) -> DbResult<()> {
        ConnectParams::validate(self.kind(), raw).map_err(DbError::invalid_input)
    }

    /// Escape a string literal for direct inclusion in SQL.
    fn escape_string(&self, input: &str) -> String {
        input.replace('\'', "''")
    }

    /// Open a native connection and wrap it into a handle. Every failure
    /// path releases whatever was allocated; no half-initialized handle is
    /// ever returned.
    async fn connect(
        &self,
        params: &ConnectParams,
        designator: &str,
        cache_capacity: usize,
    ) -> DbResult<ConnectionHandle>;

    /// Close the native connection and destroy the statement cache.
    /// Idempotent: disconnecting an already-disconnected handle succeeds.
    async fn disconnect(&self, handle: &mut ConnectionHandle) -> DbResult<()>;

    /// Verify the connection is usable. Success resets the handle's
    /// consecutive-failure counter; failure increments it and leaves status
    /// untouched - the caller decides whether to reconnect.
    async fn health_check(&self, handle: &mut ConnectionHandle) -> bool;

    /// In-place connection recovery. Engines without a reset primitive
    /// return an error so the caller reconnects from scratch.
    async fn reset_connection(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        let _ = handle;
        Err(DbError::connection(
            format!("{} has no connection reset primitive", self.kind()),
            "Reconnect from scratch instead",
        ))
    }

    /// Execute one SQL statement, returning affected rows. Low-level hook
    /// behind the transaction defaults and the migration runner.
    async fn run_statement(
        &self,
        handle: &mut ConnectionHandle,
        sql: &str,
        timeout: Duration,
    ) -> DbResult<u64>;

    /// Run a request and serialize its outcome. Failures surface as a failed
    /// `QueryResult`, never as a panic, and the handle's failure counter is
    /// updated.
    async fn execute_query(
        &self,
        handle: &mut ConnectionHandle,
        request: &QueryRequest,
    ) -> QueryResult;

    /// Execute through the handle's prepared-statement cache.
    async fn execute_prepared(
        &self,
        handle: &mut ConnectionHandle,
        request: &QueryRequest,
    ) -> QueryResult {
        let Some(name) = request.statement.as_deref() else {
            return QueryResult::failure(
                "prepared execution requested without a statement name",
                0,
            );
        };
        let Some(entry) = handle.statements.touch(name) else {
            return QueryResult::failure(
                format!("no prepared statement named '{name}'"),
                0,
            );
        };
        let mut resolved = request.clone();
        resolved.sql = entry.sql.clone();
        resolved.use_prepared = false;
        self.execute_query(handle, &resolved).await
    }

    /// Open a transaction. Fails if one is already active or the connection
    /// is unusable. Returns the transaction id.
    async fn begin_transaction(
        &self,
        handle: &mut ConnectionHandle,
        isolation: IsolationLevel,
    ) -> DbResult<String> {
        if !handle.is_connected() {
            return Err(DbError::connection(
                format!("cannot begin transaction on {}", handle.designator),
                "Reconnect before starting a transaction",
            ));
        }
        if handle.in_transaction() {
            let id = handle
                .transaction
                .as_ref()
                .map(|t| t.transaction_id.clone())
                .unwrap_or_default();
            return Err(DbError::transaction("transaction already active", id));
        }
        for sql in begin_statements(self.kind(), isolation) {
            self.run_statement(handle, &sql, TRANSACTION_OP_TIMEOUT)
                .await?;
        }
        let tx = ActiveTransaction::new(isolation);
        let id = tx.transaction_id.clone();
        handle.transaction = Some(tx);
        Ok(id)
    }

    /// Commit the active transaction. The transaction is detached from the
    /// handle before the native call, so the handle never stays wedged "in
    /// transaction" even when the commit itself fails.
    async fn commit_transaction(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        let Some(tx) = handle.clear_transaction() else {
            return Err(DbError::transaction("no active transaction", ""));
        };
        self.run_statement(handle, "COMMIT", TRANSACTION_OP_TIMEOUT)
            .await
            .map_err(|e| DbError::transaction(e.to_string(), tx.transaction_id.clone()))?;
        Ok(())
    }

    /// Roll back the active transaction. Same detach-first discipline as
    /// [`Engine::commit_transaction`].
    async fn rollback_transaction(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        let Some(tx) = handle.clear_transaction() else {
            return Err(DbError::transaction("no active transaction", ""));
        };
        self.run_statement(handle, "ROLLBACK", TRANSACTION_OP_TIMEOUT)
            .await
            .map_err(|e| DbError::transaction(e.to_string(), tx.transaction_id.clone()))?;
        Ok(())
    }

    /// Register a named statement in the handle's cache.
    async fn prepare_statement(
        &self,
        handle: &mut ConnectionHandle,
        name: &str,
        sql: &str,
    ) -> DbResult<()> {
        if !self.descriptor().supports_prepared_statements {
            return Err(DbError::invalid_input(format!(
                "{} does not support prepared statements",
                self.kind()
            )));
        }
        if name.trim().is_empty() {
            return Err(DbError::invalid_input("statement name cannot be empty"));
        }
        handle.statements.insert(name, sql);
        Ok(())
    }

    /// Drop a named statement from the handle's cache.
    async fn unprepare_statement(&self, handle: &mut ConnectionHandle, name: &str) -> DbResult<()> {
        handle.statements.remove(name);
        Ok(())
    }
}

/// Whether a statement is expected to produce rows (and should be fetched)
/// rather than executed for its side effects.
pub(crate) fn is_row_returning(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE"
    )
}

/// Engine-specific SQL to open a transaction at the given isolation level.
fn begin_statements(kind: EngineKind, isolation: IsolationLevel) -> Vec<String> {
    match kind {
        EngineKind::PostgreSQL => {
            vec![format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql())]
        }
        EngineKind::MySQL => vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()),
            "START TRANSACTION".to_string(),
        ],
        // SQLite has no per-transaction isolation levels
        EngineKind::SQLite => vec!["BEGIN".to_string()],
        // DB2 drives transactions through CLI autocommit attributes; its
        // adapter overrides the transaction methods
        EngineKind::Db2 => Vec::new(),
    }
}

/// Runtime registry of engine adapters keyed by engine kind.
pub struct EngineRegistry {
    engines: RwLock<HashMap<EngineKind, Arc<dyn Engine>>>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with all four stock adapters registered.
    pub fn with_default_engines() -> DbResult<Self> {
        let registry = Self::new();
        registry.register(Arc::new(PostgresEngine::new()))?;
        registry.register(Arc::new(MySqlEngine::new()))?;
        registry.register(Arc::new(SqliteEngine::new()))?;
        registry.register(Arc::new(Db2Engine::new()))?;
        Ok(registry)
    }

    /// Register an adapter. Refused if its descriptor is missing a mandatory
    /// operation or its kind is already registered.
    pub fn register(&self, engine: Arc<dyn Engine>) -> DbResult<()> {
        let descriptor = engine.descriptor();
        let missing = descriptor.missing_mandatory();
        if !missing.is_empty() {
            return Err(DbError::registration(
                engine.kind().to_string(),
                format!("missing mandatory operations: {}", missing.join(", ")),
            ));
        }
        let mut engines = self.engines.write().unwrap();
        if engines.contains_key(&engine.kind()) {
            return Err(DbError::registration(
                engine.kind().to_string(),
                "engine kind already registered",
            ));
        }
        info!(engine = %engine.kind(), "Registered database engine");
        engines.insert(engine.kind(), engine);
        Ok(())
    }

    /// Look up the adapter for an engine kind.
    pub fn get(&self, kind: EngineKind) -> DbResult<Arc<dyn Engine>> {
        let engines = self.engines.read().unwrap();
        engines
            .get(&kind)
            .cloned()
            .ok_or_else(|| DbError::engine_unavailable(kind.to_string(), "no adapter registered"))
    }

    /// Kinds currently registered.
    pub fn registered_kinds(&self) -> Vec<EngineKind> {
        let engines = self.engines.read().unwrap();
        let mut kinds: Vec<_> = engines.keys().copied().collect();
        kinds.sort_by_key(|k| k.display_name());
        kinds
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("registered", &self.registered_kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IncompleteEngine;

    #[async_trait]
    impl Engine for IncompleteEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::SQLite
        }

        fn descriptor(&self) -> EngineDescriptor {
            EngineDescriptor {
                provides_health_check: false,
                provides_execute_query: false,
                ..EngineDescriptor::complete(EngineKind::SQLite)
            }
        }

        fn probe_library(&self) -> Result<(), String> {
            Ok(())
        }

        async fn connect(
            &self,
            _params: &ConnectParams,
            _designator: &str,
            _cache_capacity: usize,
        ) -> DbResult<ConnectionHandle> {
            Err(DbError::internal("not implemented"))
        }

        async fn disconnect(&self, _handle: &mut ConnectionHandle) -> DbResult<()> {
            Ok(())
        }

        async fn health_check(&self, _handle: &mut ConnectionHandle) -> bool {
            false
        }

        async fn run_statement(
            &self,
            _handle: &mut ConnectionHandle,
            _sql: &str,
            _timeout: Duration,
        ) -> DbResult<u64> {
            Err(DbError::internal("not implemented"))
        }

        async fn execute_query(
            &self,
            _handle: &mut ConnectionHandle,
            _request: &QueryRequest,
        ) -> QueryResult {
            QueryResult::failure("not implemented", 0)
        }
    }

    #[test]
    fn test_registry_refuses_incomplete_descriptor() {
        let registry = EngineRegistry::new();
        let err = registry.register(Arc::new(IncompleteEngine)).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("health_check"));
        assert!(text.contains("execute_query"));
    }

    #[test]
    fn test_registry_refuses_duplicate_kind() {
        let registry = EngineRegistry::new();
        registry.register(Arc::new(SqliteEngine::new())).unwrap();
        assert!(registry.register(Arc::new(SqliteEngine::new())).is_err());
    }

    #[test]
    fn test_registry_with_default_engines() {
        let registry = EngineRegistry::with_default_engines().unwrap();
        assert_eq!(registry.registered_kinds().len(), 4);
        for kind in EngineKind::ALL {
            assert!(registry.get(kind).is_ok());
        }
    }

    #[test]
    fn test_registry_lookup_unregistered() {
        let registry = EngineRegistry::new();
        assert!(registry.get(EngineKind::Db2).is_err());
    }

    #[test]
    fn test_begin_statements_per_engine() {
        let pg = begin_statements(EngineKind::PostgreSQL, IsolationLevel::Serializable);
        assert_eq!(pg, vec!["BEGIN ISOLATION LEVEL SERIALIZABLE"]);
        let my = begin_statements(EngineKind::MySQL, IsolationLevel::ReadCommitted);
        assert_eq!(my.len(), 2);
        assert_eq!(
            begin_statements(EngineKind::SQLite, IsolationLevel::ReadCommitted),
            vec!["BEGIN"]
        );
        assert!(begin_statements(EngineKind::Db2, IsolationLevel::ReadCommitted).is_empty());
    }
}
