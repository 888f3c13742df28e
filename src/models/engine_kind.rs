//! Engine identification.
//!
//! `EngineKind` tags every connection handle, queue, and registry entry with
//! the database engine it belongs to.

use serde::{Deserialize, Serialize};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
    Db2,
}

impl EngineKind {
    /// All engine kinds, in registration order.
    pub const ALL: [EngineKind; 4] = [Self::PostgreSQL, Self::MySQL, Self::SQLite, Self::Db2];

    /// Detect the engine kind from a connection string.
    ///
    /// URI schemes identify PostgreSQL, MySQL, and SQLite; DB2 uses a
    /// semicolon-delimited keyword string (`DATABASE=...;HOSTNAME=...`)
    /// with no scheme at all.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else if lower.contains("database=") && lower.contains(';') {
            Some(Self::Db2)
        } else {
            None
        }
    }

    /// Get the display name for this engine.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
            Self::Db2 => "DB2",
        }
    }

    /// Get the default server port for this engine.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
            Self::Db2 => Some(50000),
        }
    }

    /// Whether the engine's native driver supports multi-statement
    /// transactional batches. DB2 over its CLI does not; migration scripts
    /// are split and executed statement-by-statement there.
    pub fn supports_multi_statement_transactions(&self) -> bool {
        !matches!(self, Self::Db2)
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
