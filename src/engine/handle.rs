//! Connection handles and per-connection state.
//!
//! A `ConnectionHandle` wraps one live native connection together with its
//! prepared-statement cache and health metadata. The handle is owned by
//! exactly one queue and serialized behind that queue's mutex; there is no
//! aliasing of the native connection object.

use crate::engine::db2::Db2Connection;
use crate::models::{EngineKind, IsolationLevel};
use chrono::{DateTime, Utc};
use lru::LruCache;
use sqlx::mysql::MySqlConnection;
use sqlx::postgres::PgConnection;
use sqlx::sqlite::SqliteConnection;
use std::num::NonZeroUsize;
use std::time::Instant;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// The engine-specific native connection object. Ownership is exclusive and
/// single; dropping the variant closes whatever the driver left open.
pub enum NativeConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
    Db2(Db2Connection),
}

impl NativeConnection {
    /// Engine kind of this native connection.
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Postgres(_) => EngineKind::PostgreSQL,
            Self::MySql(_) => EngineKind::MySQL,
            Self::Sqlite(_) => EngineKind::SQLite,
            Self::Db2(_) => EngineKind::Db2,
        }
    }
}

impl std::fmt::Debug for NativeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeConnection::{}", self.kind())
    }
}

/// Metadata for one cached prepared statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
    pub prepared_at: Instant,
    pub use_count: u64,
}

/// Per-connection prepared-statement cache, LRU-bounded.
///
/// Owned by exactly one `ConnectionHandle` and destroyed with it.
pub struct StatementCache {
    inner: LruCache<String, PreparedStatement>,
}

impl StatementCache {
    /// Create a cache bounded at `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Insert a statement under `name`, evicting the least-recently-used
    /// entry if the cache is full. Re-inserting an existing name replaces it.
    pub fn insert(&mut self, name: impl Into<String>, sql: impl Into<String>) {
        let name = name.into();
        let entry = PreparedStatement {
            name: name.clone(),
            sql: sql.into(),
            prepared_at: Instant::now(),
            use_count: 0,
        };
        self.inner.put(name, entry);
    }

    /// Look up a statement by name, marking it recently used.
    pub fn touch(&mut self, name: &str) -> Option<&PreparedStatement> {
        let entry = self.inner.get_mut(name)?;
        entry.use_count += 1;
        Some(entry)
    }

    /// Remove a statement by name.
    pub fn remove(&mut self, name: &str) -> Option<PreparedStatement> {
        self.inner.pop(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.cap().get())
            .finish()
    }
}

/// An open transaction on a handle. At most one per handle.
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub transaction_id: String,
    pub isolation: IsolationLevel,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

impl ActiveTransaction {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            isolation,
            active: true,
            started_at: Utc::now(),
        }
    }
}

/// One live connection plus its cache and health metadata.
///
/// Invariant: `status != Connected` implies the native connection is absent.
/// All mutation goes through the owning queue's mutex.
pub struct ConnectionHandle {
    engine: EngineKind,
    native: Option<NativeConnection>,
    status: ConnectionStatus,
    pub connected_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_health_check: Option<Instant>,
    /// Human-readable label for log correlation.
    pub designator: String,
    pub statements: StatementCache,
    pub transaction: Option<ActiveTransaction>,
}

impl ConnectionHandle {
    /// Wrap a freshly opened native connection. Status starts Connected and
    /// `connected_since` is stamped now.
    pub fn connected(
        native: NativeConnection,
        designator: impl Into<String>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            engine: native.kind(),
            native: Some(native),
            status: ConnectionStatus::Connected,
            connected_since: Some(Utc::now()),
            consecutive_failures: 0,
            last_health_check: None,
            designator: designator.into(),
            statements: StatementCache::new(cache_capacity),
            transaction: None,
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Mutable access to the native connection while it is live.
    pub fn native_mut(&mut self) -> Option<&mut NativeConnection> {
        self.native.as_mut()
    }

    /// Detach the native connection for teardown, dropping the handle to
    /// Disconnected and destroying the statement cache. Idempotent.
    pub fn take_native(&mut self) -> Option<NativeConnection> {
        self.status = ConnectionStatus::Disconnected;
        self.statements.clear();
        self.transaction = None;
        self.native.take()
    }

    /// Record a failed operation and flip to the error state, releasing the
    /// native connection so the invariant holds.
    pub fn mark_errored(&mut self) -> Option<NativeConnection> {
        self.status = ConnectionStatus::Error;
        self.statements.clear();
        self.transaction = None;
        self.native.take()
    }

    /// Record a health-check success.
    pub fn record_health_ok(&mut self) {
        self.consecutive_failures = 0;
        self.last_health_check = Some(Instant::now());
    }

    /// Record a health-check (or transient query) failure. Status is left
    /// untouched; the caller decides whether to reconnect.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Whether a transaction is currently open on this handle.
    pub fn in_transaction(&self) -> bool {
        self.transaction.as_ref().is_some_and(|t| t.active)
    }

    /// Detach the transaction record unconditionally. Called by
    /// commit/rollback on every path, success or failure, so the handle
    /// never retains a stale reference.
    pub fn clear_transaction(&mut self) -> Option<ActiveTransaction> {
        self.transaction.take()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("engine", &self.engine)
            .field("status", &self.status)
            .field("designator", &self.designator)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("in_transaction", &self.in_transaction())
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);
        cache.insert("a", "SELECT 1");
        cache.insert("b", "SELECT 2");
        // Touch "a" so "b" becomes the eviction candidate
        assert!(cache.touch("a").is_some());
        cache.insert("c", "SELECT 3");
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_statement_cache_use_count() {
        let mut cache = StatementCache::new(4);
        cache.insert("jobs_by_id", "SELECT * FROM jobs WHERE id = ?");
        cache.touch("jobs_by_id");
        cache.touch("jobs_by_id");
        let entry = cache.touch("jobs_by_id").unwrap();
        assert_eq!(entry.use_count, 3);
    }

    #[test]
    fn test_statement_cache_capacity_floor() {
        let cache = StatementCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_active_transaction_defaults() {
        let tx = ActiveTransaction::new(IsolationLevel::ReadCommitted);
        assert!(tx.active);
        assert!(!tx.transaction_id.is_empty());
    }
}
