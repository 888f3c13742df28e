//! SQLite engine adapter.
//!
//! SQLite is in-process, so "connecting" opens a database file (or the
//! `:memory:` default) rather than a socket. The adapter still honors the
//! full engine contract: timeouts apply, health checks ping, and there is no
//! reset primitive - a broken file handle means reopening from scratch.

use crate::engine::rows::RowToJson;
use crate::engine::{
    ConnectParams, ConnectionHandle, Engine, EngineDescriptor, HEALTH_CHECK_TIMEOUT,
    handle::NativeConnection, is_row_returning,
};
use crate::error::{DbError, DbResult};
use crate::models::{EngineKind, QueryParam, QueryRequest, QueryResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::{Connection, Executor};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct SqliteEngine;

impl SqliteEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::SQLite
    }

    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            supports_native_ping: true,
            ..EngineDescriptor::complete(EngineKind::SQLite)
        }
    }

    fn probe_library(&self) -> Result<(), String> {
        // SQLite is compiled into the binary
        Ok(())
    }

    async fn connect(
        &self,
        params: &ConnectParams,
        designator: &str,
        cache_capacity: usize,
    ) -> DbResult<ConnectionHandle> {
        let connection_string = params.to_connection_string(EngineKind::SQLite);
        let options = SqliteConnectOptions::from_str(&connection_string)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the path format: sqlite://path/to/db.sqlite",
                )
            })?
            .create_if_missing(true);

        debug!(designator = %designator, url = %connection_string, "Opening SQLite database");

        match timeout(
            params.connect_timeout,
            SqliteConnection::connect_with(&options),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(ConnectionHandle::connected(
                NativeConnection::Sqlite(conn),
                designator,
                cache_capacity,
            )),
            Ok(Err(e)) => Err(DbError::connection(
                format!("Failed to open database: {}", e),
                "Verify the file path exists and is writable",
            )),
            Err(_) => Err(DbError::timeout(
                "connect",
                params.connect_timeout.as_secs() as u32,
            )),
        }
    }

    async fn disconnect(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        if let Some(NativeConnection::Sqlite(conn)) = handle.take_native() {
            if let Err(e) = conn.close().await {
                warn!(designator = %handle.designator, error = %e, "Close returned an error");
            }
        }
        Ok(())
    }

    async fn health_check(&self, handle: &mut ConnectionHandle) -> bool {
        let ok = match handle.native_mut() {
            Some(NativeConnection::Sqlite(conn)) => {
                matches!(timeout(HEALTH_CHECK_TIMEOUT, conn.ping()).await, Ok(Ok(())))
            }
            _ => false,
        };
        if ok {
            handle.record_health_ok();
        } else {
            handle.record_failure();
        }
        ok
    }

    async fn run_statement(
        &self,
        handle: &mut ConnectionHandle,
        sql: &str,
        op_timeout: Duration,
    ) -> DbResult<u64> {
        let Some(NativeConnection::Sqlite(conn)) = handle.native_mut() else {
            return Err(DbError::connection(
                "no live SQLite connection",
                "Connect before executing statements",
            ));
        };
        run_raw_statement(conn, sql, op_timeout).await
    }

    async fn execute_query(
        &self,
        handle: &mut ConnectionHandle,
        request: &QueryRequest,
    ) -> QueryResult {
        let start = Instant::now();
        let query_timeout = Duration::from_secs(request.effective_timeout() as u64);

        let outcome = match handle.native_mut() {
            Some(NativeConnection::Sqlite(conn)) => {
                if is_row_returning(&request.sql) {
                    fetch_rows(conn, request, query_timeout).await
                } else {
                    execute_write(conn, request, query_timeout).await
                }
            }
            _ => Err(DbError::connection(
                "no live SQLite connection",
                "Connect before executing queries",
            )),
        };

        let elapsed = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(Outcome::Rows(rows)) => {
                handle.record_health_ok();
                let columns = rows.first().map(|r| r.column_names()).unwrap_or_default();
                let maps = rows.iter().map(|r| r.to_json_map()).collect();
                QueryResult::rows(columns, maps, elapsed)
            }
            Ok(Outcome::Affected(n)) => {
                handle.record_health_ok();
                QueryResult::write(n, elapsed)
            }
            Err(e) => {
                handle.record_failure();
                debug!(
                    designator = %handle.designator,
                    query_id = %request.query_id,
                    error = %e,
                    "Query failed"
                );
                QueryResult::failure(e.to_string(), elapsed)
            }
        }
    }
}

enum Outcome {
    Rows(Vec<sqlx::sqlite::SqliteRow>),
    Affected(u64),
}

async fn run_raw_statement(
    conn: &mut SqliteConnection,
    sql: &str,
    op_timeout: Duration,
) -> DbResult<u64> {
    match timeout(op_timeout, conn.execute(sqlx::raw_sql(sql))).await {
        Ok(Ok(result)) => Ok(result.rows_affected()),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(DbError::timeout(
            "statement execution",
            op_timeout.as_secs() as u32,
        )),
    }
}

async fn fetch_rows(
    conn: &mut SqliteConnection,
    request: &QueryRequest,
    query_timeout: Duration,
) -> DbResult<Outcome> {
    let limit = request.effective_limit() as usize;
    let mut query = sqlx::query(&request.sql);
    for param in &request.params {
        query = bind_param(query, param);
    }
    let rows_future = query.fetch(&mut *conn).take(limit).collect::<Vec<_>>();
    match timeout(query_timeout, rows_future).await {
        Ok(results) => {
            let mut rows = Vec::with_capacity(results.len());
            for result in results {
                rows.push(result.map_err(DbError::from)?);
            }
            Ok(Outcome::Rows(rows))
        }
        Err(_) => Err(DbError::timeout(
            "query execution",
            query_timeout.as_secs() as u32,
        )),
    }
}

async fn execute_write(
    conn: &mut SqliteConnection,
    request: &QueryRequest,
    query_timeout: Duration,
) -> DbResult<Outcome> {
    let mut query = sqlx::query(&request.sql);
    for param in &request.params {
        query = bind_param(query, param);
    }
    match timeout(query_timeout, query.execute(&mut *conn)).await {
        Ok(Ok(result)) => Ok(Outcome::Affected(result.rows_affected())),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(DbError::timeout(
            "write execution",
            query_timeout.as_secs() as u32,
        )),
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IsolationLevel;

    async fn memory_handle() -> ConnectionHandle {
        let engine = SqliteEngine::new();
        let params = ConnectParams::parse(EngineKind::SQLite, "sqlite://");
        engine
            .connect(&params, "sqlite-test", 8)
            .await
            .expect("in-memory open")
    }

    #[tokio::test]
    async fn test_connect_and_health_check() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;
        assert!(handle.is_connected());
        assert!(engine.health_check(&mut handle).await);
        assert_eq!(handle.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;
        engine.disconnect(&mut handle).await.unwrap();
        assert!(!handle.is_connected());
        // Second disconnect is a no-op, not an error
        engine.disconnect(&mut handle).await.unwrap();
        // A disconnected handle fails health checks without crashing
        assert!(!engine.health_check(&mut handle).await);
        assert_eq!(handle.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_query_rows() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;
        engine
            .run_statement(
                &mut handle,
                "CREATE TABLE jobs (id INTEGER PRIMARY KEY, label TEXT)",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        engine
            .run_statement(
                &mut handle,
                "INSERT INTO jobs (id, label) VALUES (1, 'badge'), (2, '42')",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let request = QueryRequest::new("SELECT id, label FROM jobs ORDER BY id");
        let result = engine.execute_query(&mut handle, &request).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.column_count, 2);
        // Intrinsically numeric id is a JSON number, not a quoted string
        assert_eq!(result.rows[0]["id"], serde_json::json!(1));
        assert_eq!(result.rows[0]["label"], serde_json::json!("badge"));
        // TEXT-stored numeral is reclassified by lexical form
        assert_eq!(result.rows[1]["label"], serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_execute_query_failure_is_result_not_panic() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;
        let request = QueryRequest::new("SELECT * FROM missing_table");
        let result = engine.execute_query(&mut handle, &request).await;
        assert!(!result.success);
        assert!(result.error_message.is_some());
        assert_eq!(handle.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_transaction_contract() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;

        let tx_id = engine
            .begin_transaction(&mut handle, IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        assert!(!tx_id.is_empty());
        assert!(handle.in_transaction());

        // Second begin on the same handle must fail
        assert!(
            engine
                .begin_transaction(&mut handle, IsolationLevel::ReadCommitted)
                .await
                .is_err()
        );

        engine.commit_transaction(&mut handle).await.unwrap();
        assert!(!handle.in_transaction());

        // Commit without an active transaction fails cleanly
        assert!(engine.commit_transaction(&mut handle).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_clears_state_even_without_connection() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;
        engine
            .begin_transaction(&mut handle, IsolationLevel::ReadCommitted)
            .await
            .unwrap();

        // Sever the native connection out from under the transaction
        drop(handle.take_native());
        assert!(!handle.in_transaction());

        // The active flag is already cleared; rollback reports the failure
        // but the handle is not wedged
        assert!(engine.rollback_transaction(&mut handle).await.is_err());
        assert!(!handle.in_transaction());
    }

    #[tokio::test]
    async fn test_mark_errored_upholds_invariant() {
        use crate::engine::ConnectionStatus;
        let mut handle = memory_handle().await;
        let native = handle.mark_errored();
        // A non-Connected handle never retains a native connection
        assert!(native.is_some());
        assert_eq!(handle.status(), ConnectionStatus::Error);
        assert!(handle.native_mut().is_none());
    }

    #[tokio::test]
    async fn test_prepared_statement_flow() {
        let engine = SqliteEngine::new();
        let mut handle = memory_handle().await;
        engine
            .run_statement(
                &mut handle,
                "CREATE TABLE t (n INTEGER)",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        engine
            .prepare_statement(&mut handle, "insert_n", "INSERT INTO t (n) VALUES (?)")
            .await
            .unwrap();

        let request = QueryRequest::new("")
            .with_param(QueryParam::Int(7))
            .prepared("insert_n");
        let result = engine.execute_prepared(&mut handle, &request).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.affected_rows, Some(1));

        // Unknown statement name is a failed result
        let missing = QueryRequest::new("").prepared("nope");
        assert!(!engine.execute_prepared(&mut handle, &missing).await.success);

        engine
            .unprepare_statement(&mut handle, "insert_n")
            .await
            .unwrap();
        assert!(!handle.statements.contains("insert_n"));
    }
}
