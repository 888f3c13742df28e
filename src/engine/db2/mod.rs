//! DB2 engine adapter.
//!
//! Speaks the DB2 CLI resolved at runtime (see [`cli`]). CLI calls block
//! their thread, so the adapter runs them under `block_in_place` and bounds
//! them with the driver's own login/query timeout attributes rather than a
//! future timeout - the CLI has no cancellable async surface.
//!
//! Transactions differ from the SQL-driven engines: the CLI drives them
//! through the autocommit connection attribute and `SQLEndTran`, and the
//! driver gives no multi-statement batch guarantee, so the migration runner
//! splits scripts and executes them statement by statement here.

pub mod cli;

use crate::engine::rows::reclassify_lexical;
use crate::engine::{
    ConnectParams, ConnectionHandle, Engine, EngineDescriptor, handle::NativeConnection,
};
use crate::error::{DbError, DbResult};
use crate::models::{EngineKind, IsolationLevel, QueryRequest, QueryResult};
use async_trait::async_trait;
use cli::{
    CliApi, SQL_ATTR_AUTOCOMMIT, SQL_ATTR_LOGIN_TIMEOUT, SQL_ATTR_QUERY_TIMEOUT,
    SQL_AUTOCOMMIT_OFF, SQL_AUTOCOMMIT_ON, SQL_C_CHAR, SQL_COMMIT, SQL_DRIVER_NOPROMPT,
    SQL_HANDLE_DBC, SQL_HANDLE_ENV, SQL_HANDLE_STMT, SQL_NO_DATA, SQL_NULL_DATA,
    SQL_NULL_HANDLE, SQL_ROLLBACK, SQL_SUCCESS, SqlHandle, SqlLen, SqlPointer, SqlSmallInt,
    SqlULen, diagnostic_text, is_numeric_type, succeeded,
};
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One live DB2 CLI connection (environment + connection handles).
///
/// All access is serialized behind the owning queue's mutex; the raw CLI
/// handles never alias.
pub struct Db2Connection {
    api: &'static CliApi,
    env: SqlHandle,
    dbc: SqlHandle,
}

// CLI handles may move between threads as long as use is serialized, which
// the owning queue's mutex guarantees.
unsafe impl Send for Db2Connection {}

/// Outcome of one executed CLI statement.
pub enum Db2Outcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<serde_json::Map<String, JsonValue>>,
    },
    Affected(u64),
}

impl Db2Connection {
    /// Open a connection with the keyword connection string.
    pub fn open(connection_string: &str, login_timeout: Duration) -> Result<Self, String> {
        let api = cli::cli_api()?;

        let mut env: SqlHandle = SQL_NULL_HANDLE;
        let rc = unsafe { (api.alloc_handle)(SQL_HANDLE_ENV, SQL_NULL_HANDLE, &mut env) };
        if !succeeded(rc) {
            return Err("SQLAllocHandle(ENV) failed".to_string());
        }

        let mut dbc: SqlHandle = SQL_NULL_HANDLE;
        let rc = unsafe { (api.alloc_handle)(SQL_HANDLE_DBC, env, &mut dbc) };
        if !succeeded(rc) {
            let reason = diagnostic_text(api, SQL_HANDLE_ENV, env);
            unsafe { (api.free_handle)(SQL_HANDLE_ENV, env) };
            return Err(format!("SQLAllocHandle(DBC) failed: {reason}"));
        }

        unsafe {
            (api.set_connect_attr)(
                dbc,
                SQL_ATTR_LOGIN_TIMEOUT,
                login_timeout.as_secs() as SqlULen as SqlPointer,
                0,
            );
        }

        let mut out_len: SqlSmallInt = 0;
        let rc = unsafe {
            (api.driver_connect)(
                dbc,
                SQL_NULL_HANDLE,
                connection_string.as_ptr(),
                connection_string.len() as SqlSmallInt,
                std::ptr::null_mut(),
                0,
                &mut out_len,
                SQL_DRIVER_NOPROMPT,
            )
        };
        if !succeeded(rc) {
            let reason = diagnostic_text(api, SQL_HANDLE_DBC, dbc);
            unsafe {
                (api.free_handle)(SQL_HANDLE_DBC, dbc);
                (api.free_handle)(SQL_HANDLE_ENV, env);
            }
            return Err(reason);
        }

        Ok(Self { api, env, dbc })
    }

    /// Disconnect and free both CLI handles. Safe to call once; `Drop` covers
    /// abandonment.
    pub fn close(&mut self) {
        if self.dbc.is_null() {
            return;
        }
        unsafe {
            (self.api.disconnect)(self.dbc);
            (self.api.free_handle)(SQL_HANDLE_DBC, self.dbc);
            (self.api.free_handle)(SQL_HANDLE_ENV, self.env);
        }
        self.dbc = SQL_NULL_HANDLE;
        self.env = SQL_NULL_HANDLE;
    }

    /// Execute one statement, bounded by the driver's query-timeout
    /// attribute.
    pub fn execute(&mut self, sql: &str, timeout: Duration) -> Result<Db2Outcome, String> {
        let api = self.api;
        let mut stmt: SqlHandle = SQL_NULL_HANDLE;
        let rc = unsafe { (api.alloc_handle)(SQL_HANDLE_STMT, self.dbc, &mut stmt) };
        if !succeeded(rc) {
            return Err(diagnostic_text(api, SQL_HANDLE_DBC, self.dbc));
        }
        let result = self.execute_on_stmt(stmt, sql, timeout);
        unsafe { (api.free_handle)(SQL_HANDLE_STMT, stmt) };
        result
    }

    fn execute_on_stmt(
        &self,
        stmt: SqlHandle,
        sql: &str,
        timeout: Duration,
    ) -> Result<Db2Outcome, String> {
        let api = self.api;
        unsafe {
            (api.set_stmt_attr)(
                stmt,
                SQL_ATTR_QUERY_TIMEOUT,
                timeout.as_secs() as SqlULen as SqlPointer,
                0,
            );
        }

        let rc = unsafe { (api.exec_direct)(stmt, sql.as_ptr(), sql.len() as i32) };
        if rc == SQL_NO_DATA {
            return Ok(Db2Outcome::Affected(0));
        }
        if !succeeded(rc) {
            return Err(diagnostic_text(api, SQL_HANDLE_STMT, stmt));
        }

        let mut column_count: SqlSmallInt = 0;
        unsafe { (api.num_result_cols)(stmt, &mut column_count) };
        if column_count <= 0 {
            let mut affected: SqlLen = 0;
            unsafe { (api.row_count)(stmt, &mut affected) };
            return Ok(Db2Outcome::Affected(affected.max(0) as u64));
        }

        let mut columns = Vec::with_capacity(column_count as usize);
        let mut numeric = Vec::with_capacity(column_count as usize);
        for col in 1..=column_count as u16 {
            let mut name = [0u8; 256];
            let mut name_len: SqlSmallInt = 0;
            let mut data_type: SqlSmallInt = 0;
            let mut size: SqlULen = 0;
            let mut digits: SqlSmallInt = 0;
            let mut nullable: SqlSmallInt = 0;
            let rc = unsafe {
                (api.describe_col)(
                    stmt,
                    col,
                    name.as_mut_ptr(),
                    name.len() as SqlSmallInt,
                    &mut name_len,
                    &mut data_type,
                    &mut size,
                    &mut digits,
                    &mut nullable,
                )
            };
            if !succeeded(rc) {
                return Err(diagnostic_text(api, SQL_HANDLE_STMT, stmt));
            }
            let len = (name_len.max(0) as usize).min(name.len());
            columns.push(String::from_utf8_lossy(&name[..len]).to_string());
            numeric.push(is_numeric_type(data_type));
        }

        let mut rows = Vec::new();
        loop {
            let rc = unsafe { (api.fetch)(stmt) };
            if rc == SQL_NO_DATA {
                break;
            }
            if !succeeded(rc) {
                return Err(diagnostic_text(api, SQL_HANDLE_STMT, stmt));
            }
            let mut row = serde_json::Map::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let value = match self.get_string_value(stmt, (idx + 1) as u16)? {
                    // DB2 returns everything as character data here; numeric
                    // columns are reclassified so they serialize unquoted
                    Some(text) if numeric[idx] => reclassify_lexical(text),
                    Some(text) => JsonValue::String(text),
                    None => JsonValue::Null,
                };
                row.insert(column.clone(), value);
            }
            rows.push(row);
        }

        Ok(Db2Outcome::Rows { columns, rows })
    }

    /// Retrieve one column of the current row as text, part by part.
    fn get_string_value(&self, stmt: SqlHandle, col: u16) -> Result<Option<String>, String> {
        let api = self.api;
        let mut value = Vec::new();
        loop {
            let mut buf = [0u8; 4096];
            let mut indicator: SqlLen = 0;
            let rc = unsafe {
                (api.get_data)(
                    stmt,
                    col,
                    SQL_C_CHAR,
                    buf.as_mut_ptr() as SqlPointer,
                    buf.len() as SqlLen,
                    &mut indicator,
                )
            };
            if rc == SQL_NO_DATA {
                break;
            }
            if !succeeded(rc) {
                return Err(diagnostic_text(api, SQL_HANDLE_STMT, stmt));
            }
            if indicator == SQL_NULL_DATA {
                return Ok(None);
            }
            // Character retrieval reserves one byte for the terminator
            let available = if indicator < 0 {
                buf.len() - 1
            } else {
                (indicator as usize).min(buf.len() - 1)
            };
            value.extend_from_slice(&buf[..available]);
            if rc == SQL_SUCCESS {
                break;
            }
        }
        Ok(Some(String::from_utf8_lossy(&value).to_string()))
    }

    /// Toggle the CLI autocommit attribute.
    pub fn set_autocommit(&mut self, on: bool) -> Result<(), String> {
        let value = if on { SQL_AUTOCOMMIT_ON } else { SQL_AUTOCOMMIT_OFF };
        let rc = unsafe {
            (self.api.set_connect_attr)(self.dbc, SQL_ATTR_AUTOCOMMIT, value as SqlPointer, 0)
        };
        if succeeded(rc) {
            Ok(())
        } else {
            Err(diagnostic_text(self.api, SQL_HANDLE_DBC, self.dbc))
        }
    }

    /// Finish the current unit of work.
    pub fn end_transaction(&mut self, commit: bool) -> Result<(), String> {
        let completion = if commit { SQL_COMMIT } else { SQL_ROLLBACK };
        let rc = unsafe { (self.api.end_tran)(SQL_HANDLE_DBC, self.dbc, completion) };
        if succeeded(rc) {
            Ok(())
        } else {
            Err(diagnostic_text(self.api, SQL_HANDLE_DBC, self.dbc))
        }
    }

    /// Cheap usability probe against the CLI dummy table.
    pub fn ping(&mut self, timeout: Duration) -> bool {
        self.execute("SELECT 1 FROM SYSIBM.SYSDUMMY1", timeout).is_ok()
    }
}

impl Drop for Db2Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Db2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db2Connection")
            .field("connected", &!self.dbc.is_null())
            .finish()
    }
}

/// Run a blocking CLI call without starving the async executor.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle)
            if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
        {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

pub struct Db2Engine;

impl Db2Engine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Db2Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for Db2Engine {
    fn kind(&self) -> EngineKind {
        EngineKind::Db2
    }

    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            multi_statement_transactions: false,
            ..EngineDescriptor::complete(EngineKind::Db2)
        }
    }

    fn probe_library(&self) -> Result<(), String> {
        cli::cli_api().map(|_| ())
    }

    async fn connect(
        &self,
        params: &ConnectParams,
        designator: &str,
        cache_capacity: usize,
    ) -> DbResult<ConnectionHandle> {
        cli::cli_api().map_err(|reason| DbError::engine_unavailable("DB2", reason))?;

        let connection_string = params.to_connection_string(EngineKind::Db2);
        debug!(
            designator = %designator,
            url = %params.masked(EngineKind::Db2),
            "Connecting to DB2"
        );

        let login_timeout = params.connect_timeout;
        let conn = blocking(move || Db2Connection::open(&connection_string, login_timeout));
        match conn {
            Ok(conn) => Ok(ConnectionHandle::connected(
                NativeConnection::Db2(conn),
                designator,
                cache_capacity,
            )),
            Err(reason) => Err(DbError::connection(
                format!("Failed to connect: {reason}"),
                "Check the keyword string: DATABASE=...;HOSTNAME=...;PORT=...;UID=...;PWD=...",
            )),
        }
    }

    async fn disconnect(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        if let Some(NativeConnection::Db2(mut conn)) = handle.take_native() {
            blocking(move || conn.close());
        }
        Ok(())
    }

    async fn health_check(&self, handle: &mut ConnectionHandle) -> bool {
        let ok = match handle.native_mut() {
            Some(NativeConnection::Db2(conn)) => {
                blocking(|| conn.ping(crate::engine::HEALTH_CHECK_TIMEOUT))
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
        let Some(NativeConnection::Db2(conn)) = handle.native_mut() else {
            return Err(DbError::connection(
                "no live DB2 connection",
                "Connect before executing statements",
            ));
        };
        match blocking(|| conn.execute(sql, op_timeout)) {
            Ok(Db2Outcome::Affected(n)) => Ok(n),
            Ok(Db2Outcome::Rows { rows, .. }) => Ok(rows.len() as u64),
            Err(reason) => Err(DbError::database(reason, None, "Check the SQL statement")),
        }
    }

    async fn execute_query(
        &self,
        handle: &mut ConnectionHandle,
        request: &QueryRequest,
    ) -> QueryResult {
        let start = Instant::now();
        let query_timeout = Duration::from_secs(request.effective_timeout() as u64);

        if !request.params.is_empty() {
            // Parameter markers would need SQLBindParameter; the data tier
            // inlines values for DB2 via escape_string instead
            return QueryResult::failure(
                "DB2 adapter does not bind parameters; inline escaped values",
                start.elapsed().as_millis() as u64,
            );
        }

        let outcome = match handle.native_mut() {
            Some(NativeConnection::Db2(conn)) => {
                blocking(|| conn.execute(&request.sql, query_timeout))
            }
            _ => Err("no live DB2 connection".to_string()),
        };

        let elapsed = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(Db2Outcome::Rows { columns, rows }) => {
                handle.record_health_ok();
                QueryResult::rows(columns, rows, elapsed)
            }
            Ok(Db2Outcome::Affected(n)) => {
                handle.record_health_ok();
                QueryResult::write(n, elapsed)
            }
            Err(reason) => {
                handle.record_failure();
                debug!(
                    designator = %handle.designator,
                    query_id = %request.query_id,
                    error = %reason,
                    "Query failed"
                );
                QueryResult::failure(reason, elapsed)
            }
        }
    }

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
        let Some(NativeConnection::Db2(conn)) = handle.native_mut() else {
            return Err(DbError::connection(
                "no live DB2 connection",
                "Connect before starting a transaction",
            ));
        };
        blocking(|| conn.set_autocommit(false))
            .map_err(|reason| DbError::transaction(reason, ""))?;
        let tx = crate::engine::ActiveTransaction::new(isolation);
        let id = tx.transaction_id.clone();
        handle.transaction = Some(tx);
        Ok(id)
    }

    async fn commit_transaction(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        let Some(tx) = handle.clear_transaction() else {
            return Err(DbError::transaction("no active transaction", ""));
        };
        let Some(NativeConnection::Db2(conn)) = handle.native_mut() else {
            return Err(DbError::transaction(
                "connection lost before commit",
                tx.transaction_id,
            ));
        };
        let result = blocking(|| {
            let outcome = conn.end_transaction(true);
            if let Err(reason) = conn.set_autocommit(true) {
                warn!(error = %reason, "Failed to restore autocommit after commit");
            }
            outcome
        });
        result.map_err(|reason| DbError::transaction(reason, tx.transaction_id.clone()))
    }

    async fn rollback_transaction(&self, handle: &mut ConnectionHandle) -> DbResult<()> {
        let Some(tx) = handle.clear_transaction() else {
            return Err(DbError::transaction("no active transaction", ""));
        };
        let Some(NativeConnection::Db2(conn)) = handle.native_mut() else {
            return Err(DbError::transaction(
                "connection lost before rollback",
                tx.transaction_id,
            ));
        };
        let result = blocking(|| {
            let outcome = conn.end_transaction(false);
            if let Err(reason) = conn.set_autocommit(true) {
                warn!(error = %reason, "Failed to restore autocommit after rollback");
            }
            outcome
        });
        result.map_err(|reason| DbError::transaction(reason, tx.transaction_id.clone()))
    }
}
