//! Query-related data models.
//!
//! This module defines types for SQL query requests and results exchanged
//! between callers and the queue layer. Requests are caller-owned and live
//! for one call; results are returned by value to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default row limit for query results.
pub const DEFAULT_ROW_LIMIT: u32 = 100;

/// Maximum allowed row limit.
pub const MAX_ROW_LIMIT: u32 = 10000;

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u32 = 30;

/// Maximum query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u32 = 300;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of this isolation level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A unit of database work submitted to a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Unique request identifier for log correlation.
    pub query_id: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Default: 30, max: 300
    #[serde(default)]
    pub timeout_secs: Option<u32>,
    /// Isolation level to apply if this request opens a transaction.
    #[serde(default)]
    pub isolation: Option<IsolationLevel>,
    /// Execute through the handle's prepared-statement cache.
    #[serde(default)]
    pub use_prepared: bool,
    /// Name of the cached prepared statement to use. Ignored unless
    /// `use_prepared` is set.
    #[serde(default)]
    pub statement: Option<String>,
    /// Default: 100, max: 10000
    #[serde(default)]
    pub limit: Option<u32>,
}

impl QueryRequest {
    /// Create a new query request with default options.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            sql: sql.into(),
            params: Vec::new(),
            timeout_secs: None,
            isolation: None,
            use_prepared: false,
            statement: None,
            limit: None,
        }
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the row limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Route this request through the named prepared statement.
    pub fn prepared(mut self, statement: impl Into<String>) -> Self {
        self.use_prepared = true;
        self.statement = Some(statement.into());
        self
    }

    /// Get the effective timeout (with bounds checking).
    pub fn effective_timeout(&self) -> u32 {
        self.timeout_secs
            .map(|t| t.min(MAX_QUERY_TIMEOUT_SECS))
            .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS)
    }

    /// Get the effective row limit (with bounds checking).
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .map(|l| l.clamp(1, MAX_ROW_LIMIT))
            .unwrap_or(DEFAULT_ROW_LIMIT)
    }
}

/// Outcome of one executed request. `error_message` is present exactly when
/// `success` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a successful result carrying rows.
    pub fn rows(
        columns: Vec<String>,
        rows: Vec<serde_json::Map<String, JsonValue>>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            row_count: rows.len(),
            column_count: columns.len(),
            columns,
            rows,
            affected_rows: None,
            error_message: None,
            execution_time_ms,
        }
    }

    /// Create a successful result for a write operation.
    pub fn write(affected_rows: u64, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            row_count: 0,
            column_count: 0,
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: Some(affected_rows),
            error_message: None,
            execution_time_ms,
        }
    }

    /// Create a failed result. The connection is left to the caller; a
    /// failed result never implies a torn-down handle.
    pub fn failure(error_message: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            row_count: 0,
            column_count: 0,
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: None,
            error_message: Some(error_message.into()),
            execution_time_ms,
        }
    }

    /// Check if the result carries neither rows nor an affected count.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.affected_rows.is_none()
    }
}
