//! Minimal DB2 CLI binding, resolved from a shared library at runtime.
//!
//! There is no Rust driver for DB2, so the adapter speaks the DB2 CLI (an
//! ODBC-compatible C ABI) directly. The client library is optional: it is
//! probed once from a short ordered list of well-known names, and the
//! outcome - including failure - is cached for the process lifetime so a
//! missing installation is reported exactly once and never re-attempted.
//!
//! Only the handful of entry points the adapter needs are resolved. All
//! calls are `unsafe` at this layer; `Db2Connection` in the parent module is
//! the safe wrapper that serializes access.

use libloading::Library;
use std::ffi::c_void;
use std::sync::OnceLock;

pub type SqlReturn = i16;
pub type SqlSmallInt = i16;
pub type SqlUSmallInt = u16;
pub type SqlInteger = i32;
pub type SqlLen = isize;
pub type SqlULen = usize;
pub type SqlHandle = *mut c_void;
pub type SqlPointer = *mut c_void;

pub const SQL_SUCCESS: SqlReturn = 0;
pub const SQL_SUCCESS_WITH_INFO: SqlReturn = 1;
pub const SQL_NO_DATA: SqlReturn = 100;

pub const SQL_HANDLE_ENV: SqlSmallInt = 1;
pub const SQL_HANDLE_DBC: SqlSmallInt = 2;
pub const SQL_HANDLE_STMT: SqlSmallInt = 3;

pub const SQL_NULL_HANDLE: SqlHandle = std::ptr::null_mut();
pub const SQL_NULL_DATA: SqlLen = -1;
pub const SQL_NTS: SqlInteger = -3;

pub const SQL_DRIVER_NOPROMPT: SqlUSmallInt = 0;
pub const SQL_C_CHAR: SqlSmallInt = 1;

pub const SQL_ATTR_QUERY_TIMEOUT: SqlInteger = 0;
pub const SQL_ATTR_AUTOCOMMIT: SqlInteger = 102;
pub const SQL_ATTR_LOGIN_TIMEOUT: SqlInteger = 103;
pub const SQL_AUTOCOMMIT_OFF: SqlULen = 0;
pub const SQL_AUTOCOMMIT_ON: SqlULen = 1;

pub const SQL_COMMIT: SqlSmallInt = 0;
pub const SQL_ROLLBACK: SqlSmallInt = 1;

// Column data type codes that carry intrinsically numeric values
pub const SQL_NUMERIC: SqlSmallInt = 2;
pub const SQL_DECIMAL: SqlSmallInt = 3;
pub const SQL_INTEGER: SqlSmallInt = 4;
pub const SQL_SMALLINT: SqlSmallInt = 5;
pub const SQL_FLOAT: SqlSmallInt = 6;
pub const SQL_REAL: SqlSmallInt = 7;
pub const SQL_DOUBLE: SqlSmallInt = 8;
pub const SQL_BIGINT: SqlSmallInt = -5;

/// Shared library names probed in order.
pub const LIBRARY_NAMES: &[&str] = &[
    "libdb2.so.1",
    "libdb2.so",
    "libdb2.dylib",
    "db2cli64.dll",
    "db2cli.dll",
];

/// Whether a CLI return code indicates success.
pub fn succeeded(rc: SqlReturn) -> bool {
    rc == SQL_SUCCESS || rc == SQL_SUCCESS_WITH_INFO
}

/// Whether a described column type holds numeric values.
pub fn is_numeric_type(data_type: SqlSmallInt) -> bool {
    matches!(
        data_type,
        SQL_NUMERIC | SQL_DECIMAL | SQL_INTEGER | SQL_SMALLINT | SQL_FLOAT | SQL_REAL | SQL_DOUBLE
            | SQL_BIGINT
    )
}

/// Resolved CLI entry points. Function pointers stay valid for the process
/// lifetime because the backing library is intentionally leaked.
#[allow(clippy::type_complexity)]
pub struct CliApi {
    pub alloc_handle:
        unsafe extern "system" fn(SqlSmallInt, SqlHandle, *mut SqlHandle) -> SqlReturn,
    pub free_handle: unsafe extern "system" fn(SqlSmallInt, SqlHandle) -> SqlReturn,
    pub driver_connect: unsafe extern "system" fn(
        SqlHandle,
        SqlHandle,
        *const u8,
        SqlSmallInt,
        *mut u8,
        SqlSmallInt,
        *mut SqlSmallInt,
        SqlUSmallInt,
    ) -> SqlReturn,
    pub disconnect: unsafe extern "system" fn(SqlHandle) -> SqlReturn,
    pub exec_direct: unsafe extern "system" fn(SqlHandle, *const u8, SqlInteger) -> SqlReturn,
    pub end_tran: unsafe extern "system" fn(SqlSmallInt, SqlHandle, SqlSmallInt) -> SqlReturn,
    pub set_connect_attr:
        unsafe extern "system" fn(SqlHandle, SqlInteger, SqlPointer, SqlInteger) -> SqlReturn,
    pub set_stmt_attr:
        unsafe extern "system" fn(SqlHandle, SqlInteger, SqlPointer, SqlInteger) -> SqlReturn,
    pub num_result_cols: unsafe extern "system" fn(SqlHandle, *mut SqlSmallInt) -> SqlReturn,
    pub row_count: unsafe extern "system" fn(SqlHandle, *mut SqlLen) -> SqlReturn,
    pub fetch: unsafe extern "system" fn(SqlHandle) -> SqlReturn,
    pub get_data: unsafe extern "system" fn(
        SqlHandle,
        SqlUSmallInt,
        SqlSmallInt,
        SqlPointer,
        SqlLen,
        *mut SqlLen,
    ) -> SqlReturn,
    pub describe_col: unsafe extern "system" fn(
        SqlHandle,
        SqlUSmallInt,
        *mut u8,
        SqlSmallInt,
        *mut SqlSmallInt,
        *mut SqlSmallInt,
        *mut SqlULen,
        *mut SqlSmallInt,
        *mut SqlSmallInt,
    ) -> SqlReturn,
    pub get_diag_rec: unsafe extern "system" fn(
        SqlSmallInt,
        SqlHandle,
        SqlSmallInt,
        *mut u8,
        *mut SqlInteger,
        *mut u8,
        SqlSmallInt,
        *mut SqlSmallInt,
    ) -> SqlReturn,
}

static CLI: OnceLock<Result<CliApi, String>> = OnceLock::new();

/// Resolve the DB2 CLI, probing once and caching the outcome.
pub fn cli_api() -> Result<&'static CliApi, String> {
    CLI.get_or_init(load_api).as_ref().map_err(Clone::clone)
}

// Runs exactly once per process; the OnceLock caches the outcome, so the
// missing-library case is reported a single time rather than per call.
fn load_api() -> Result<CliApi, String> {
    let mut last_error = String::from("no candidates probed");
    for name in LIBRARY_NAMES {
        match unsafe { Library::new(name) } {
            Ok(lib) => {
                // Never unloaded: resolved function pointers must stay valid
                let lib: &'static Library = Box::leak(Box::new(lib));
                let api = resolve_symbols(lib)
                    .map_err(|e| format!("{name} loaded but symbol resolution failed: {e}"));
                match &api {
                    Ok(_) => tracing::info!(library = %name, "Loaded DB2 client library"),
                    Err(e) => tracing::warn!(error = %e, "DB2 client library unusable"),
                }
                return api;
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    let reason = format!(
        "no DB2 client library found (probed {}): {last_error}",
        LIBRARY_NAMES.join(", ")
    );
    tracing::warn!(reason = %reason, "DB2 engine unavailable");
    Err(reason)
}

fn resolve_symbols(lib: &'static Library) -> Result<CliApi, String> {
    macro_rules! sym {
        ($name:literal) => {
            unsafe {
                *lib.get($name)
                    .map_err(|e| format!("{}: {e}", String::from_utf8_lossy($name)))?
            }
        };
    }
    Ok(CliApi {
        alloc_handle: sym!(b"SQLAllocHandle"),
        free_handle: sym!(b"SQLFreeHandle"),
        driver_connect: sym!(b"SQLDriverConnect"),
        disconnect: sym!(b"SQLDisconnect"),
        exec_direct: sym!(b"SQLExecDirect"),
        end_tran: sym!(b"SQLEndTran"),
        set_connect_attr: sym!(b"SQLSetConnectAttr"),
        set_stmt_attr: sym!(b"SQLSetStmtAttr"),
        num_result_cols: sym!(b"SQLNumResultCols"),
        row_count: sym!(b"SQLRowCount"),
        fetch: sym!(b"SQLFetch"),
        get_data: sym!(b"SQLGetData"),
        describe_col: sym!(b"SQLDescribeCol"),
        get_diag_rec: sym!(b"SQLGetDiagRec"),
    })
}

/// Read the first diagnostic record for a handle as display text.
pub fn diagnostic_text(api: &CliApi, handle_type: SqlSmallInt, handle: SqlHandle) -> String {
    let mut sqlstate = [0u8; 6];
    let mut native_error: SqlInteger = 0;
    let mut message = [0u8; 512];
    let mut message_len: SqlSmallInt = 0;
    let rc = unsafe {
        (api.get_diag_rec)(
            handle_type,
            handle,
            1,
            sqlstate.as_mut_ptr(),
            &mut native_error,
            message.as_mut_ptr(),
            message.len() as SqlSmallInt,
            &mut message_len,
        )
    };
    if !succeeded(rc) {
        return "no diagnostic available".to_string();
    }
    let state = String::from_utf8_lossy(&sqlstate[..5]).to_string();
    let len = (message_len.max(0) as usize).min(message.len());
    let text = String::from_utf8_lossy(&message[..len]).to_string();
    format!("[{state}] {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded() {
        assert!(succeeded(SQL_SUCCESS));
        assert!(succeeded(SQL_SUCCESS_WITH_INFO));
        assert!(!succeeded(SQL_NO_DATA));
        assert!(!succeeded(-1));
    }

    #[test]
    fn test_numeric_type_codes() {
        assert!(is_numeric_type(SQL_INTEGER));
        assert!(is_numeric_type(SQL_DECIMAL));
        assert!(is_numeric_type(SQL_BIGINT));
        assert!(!is_numeric_type(1)); // SQL_CHAR
        assert!(!is_numeric_type(12)); // SQL_VARCHAR
    }

    #[test]
    fn test_probe_outcome_is_cached() {
        // Whatever the host has installed, two probes agree and the second
        // returns instantly from the cache
        let first = cli_api().map(|_| ());
        let second = cli_api().map(|_| ());
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
