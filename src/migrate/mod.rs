//! Schema migration runner.
//!
//! Discovers versioned migration scripts, orders them by their numeric
//! suffix, and applies them through a Lead queue's connection with the
//! transaction strategy the engine supports: one transactional unit where
//! the driver guarantees multi-statement batches, or an explicit
//! split-and-execute path (DB2) where it does not. A failed statement rolls
//! back its script and halts the remaining run - migrations are never
//! partially applied within a script, and later scripts never run past a
//! failure.
//!
//! Re-running against an already-migrated database is the scripts' concern
//! (`CREATE TABLE IF NOT EXISTS`-style generation); the runner applies every
//! discovered script, in order, every time it is invoked.

pub mod script;

pub use script::{
    RenderedSql, STATEMENT_DELIMITER, ScriptInterpreter, ScriptParams, TemplateInterpreter,
    split_statements,
};

use crate::engine::{ConnectionHandle, Engine};
use crate::error::{DbError, DbResult};
use crate::models::IsolationLevel;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout applied to each migration statement.
pub const MIGRATION_STATEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum digits in a script's sequence suffix.
const MAX_SEQUENCE_DIGITS: usize = 6;

/// A migration script in the compile-time embedded catalog.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedScript {
    /// File-style name, e.g. `core_00001.lua`.
    pub name: &'static str,
    pub contents: &'static str,
}

/// Embedded migration scripts registered with the subsystem at construction.
#[derive(Debug, Default)]
pub struct MigrationCatalog {
    embedded: Vec<EmbeddedScript>,
}

impl MigrationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog over a static script table.
    pub fn with_embedded(scripts: &[EmbeddedScript]) -> Self {
        Self {
            embedded: scripts.to_vec(),
        }
    }

    /// Embedded scripts whose name starts with `prefix`.
    fn with_prefix(&self, prefix: &str) -> Vec<&EmbeddedScript> {
        self.embedded
            .iter()
            .filter(|s| s.name.starts_with(prefix))
            .collect()
    }
}

/// Where a database's migration scripts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    /// Embedded catalog entries under a name prefix.
    Embedded(String),
    /// Filesystem directory of script files.
    Directory(PathBuf),
}

impl MigrationSource {
    /// Parse the configured source string: `embedded:<prefix>` selects the
    /// catalog, anything else is a directory path.
    pub fn parse(configured: &str) -> Self {
        match configured.strip_prefix("embedded:") {
            Some(prefix) => Self::Embedded(prefix.to_string()),
            None => Self::Directory(PathBuf::from(configured)),
        }
    }
}

impl std::fmt::Display for MigrationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded(prefix) => write!(f, "embedded:{prefix}"),
            Self::Directory(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One discovered script, ready to render and apply.
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub name: String,
    pub sequence: u32,
    pub contents: String,
}

/// Parse the numeric suffix out of `<name>_<NNNNN>.<ext>`. Malformed names
/// (missing extension, missing underscore, non-digit or oversized suffix)
/// yield `None` and are skipped by discovery.
fn parse_sequence(file_name: &str) -> Option<u32> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    let (_, digits) = stem.rsplit_once('_')?;
    if digits.is_empty() || digits.len() > MAX_SEQUENCE_DIGITS {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Collect all well-formed scripts for a source, sorted ascending by
/// sequence number. Malformed filenames are skipped, not fatal.
pub fn discover(source: &MigrationSource, catalog: &MigrationCatalog) -> DbResult<Vec<MigrationScript>> {
    let mut scripts = Vec::new();
    match source {
        MigrationSource::Embedded(prefix) => {
            for embedded in catalog.with_prefix(prefix) {
                match parse_sequence(embedded.name) {
                    Some(sequence) => scripts.push(MigrationScript {
                        name: embedded.name.to_string(),
                        sequence,
                        contents: embedded.contents.to_string(),
                    }),
                    None => {
                        debug!(script = %embedded.name, "Skipping malformed migration name");
                    }
                }
            }
        }
        MigrationSource::Directory(dir) => {
            let entries = std::fs::read_dir(dir).map_err(|e| {
                DbError::configuration(format!(
                    "cannot read migration directory {}: {e}",
                    dir.display()
                ))
            })?;
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().to_string();
                let Some(sequence) = parse_sequence(&file_name) else {
                    debug!(script = %file_name, "Skipping malformed migration name");
                    continue;
                };
                let contents = std::fs::read_to_string(entry.path()).map_err(|e| {
                    DbError::configuration(format!("cannot read migration {file_name}: {e}"))
                })?;
                scripts.push(MigrationScript {
                    name: file_name,
                    sequence,
                    contents,
                });
            }
        }
    }
    scripts.sort_by_key(|s| s.sequence);
    Ok(scripts)
}

/// Read-only pre-flight check: confirm the source holds at least one
/// well-formed script and report the lowest-numbered one as evidence,
/// without executing anything.
pub fn validate_source(
    source: &MigrationSource,
    catalog: &MigrationCatalog,
) -> Result<String, String> {
    let scripts = discover(source, catalog).map_err(|e| e.to_string())?;
    match scripts.first() {
        Some(first) => Ok(first.name.clone()),
        None => Err(format!("no migration scripts found in {source}")),
    }
}

/// Applies discovered scripts through an engine connection.
pub struct MigrationRunner<'a> {
    engine: &'a dyn Engine,
    interpreter: &'a dyn ScriptInterpreter,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(engine: &'a dyn Engine, interpreter: &'a dyn ScriptInterpreter) -> Self {
        Self {
            engine,
            interpreter,
        }
    }

    /// Apply every script in order. Returns the number applied. The first
    /// script failure rolls that script back and aborts the rest of the run.
    pub async fn run(
        &self,
        handle: &mut ConnectionHandle,
        scripts: &[MigrationScript],
        params: &ScriptParams<'_>,
    ) -> DbResult<usize> {
        let native_transactions = self.engine.descriptor().multi_statement_transactions;
        for script in scripts {
            let rendered = self.interpreter.render(&script.contents, params)?;
            debug!(
                script = %script.name,
                statements = rendered.statement_count,
                "Applying migration"
            );
            if native_transactions {
                self.apply_as_unit(handle, script, &rendered).await?;
            } else {
                self.apply_split(handle, script, &rendered).await?;
            }
            info!(script = %script.name, "Migration applied");
        }
        Ok(scripts.len())
    }

    /// Submit the whole generated SQL as one transactional unit.
    async fn apply_as_unit(
        &self,
        handle: &mut ConnectionHandle,
        script: &MigrationScript,
        rendered: &RenderedSql,
    ) -> DbResult<()> {
        // Delimiter markers drop out and statements join into one
        // semicolon-separated batch the driver runs as a unit
        let unit = split_statements(&rendered.sql).join(";\n");
        self.engine
            .begin_transaction(handle, IsolationLevel::ReadCommitted)
            .await
            .map_err(|e| DbError::migration(&script.name, None, e.to_string()))?;
        match self
            .engine
            .run_statement(handle, &unit, MIGRATION_STATEMENT_TIMEOUT)
            .await
        {
            Ok(_) => self
                .engine
                .commit_transaction(handle)
                .await
                .map_err(|e| DbError::migration(&script.name, None, e.to_string())),
            Err(e) => {
                self.rollback_quietly(handle, &script.name).await;
                Err(DbError::migration(&script.name, None, e.to_string()))
            }
        }
    }

    /// Split the SQL on the delimiter and execute statement by statement
    /// inside an explicit transaction; commit only if every statement
    /// succeeded.
    async fn apply_split(
        &self,
        handle: &mut ConnectionHandle,
        script: &MigrationScript,
        rendered: &RenderedSql,
    ) -> DbResult<()> {
        let statements = split_statements(&rendered.sql);
        self.engine
            .begin_transaction(handle, IsolationLevel::ReadCommitted)
            .await
            .map_err(|e| DbError::migration(&script.name, None, e.to_string()))?;
        for (index, statement) in statements.iter().enumerate() {
            if let Err(e) = self
                .engine
                .run_statement(handle, statement, MIGRATION_STATEMENT_TIMEOUT)
                .await
            {
                self.rollback_quietly(handle, &script.name).await;
                return Err(DbError::migration(
                    &script.name,
                    Some(index + 1),
                    e.to_string(),
                ));
            }
        }
        self.engine
            .commit_transaction(handle)
            .await
            .map_err(|e| DbError::migration(&script.name, None, e.to_string()))
    }

    async fn rollback_quietly(&self, handle: &mut ConnectionHandle, script: &str) {
        if let Err(e) = self.engine.rollback_transaction(handle).await {
            warn!(script = %script, error = %e, "Rollback after failed migration also failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequence_well_formed() {
        assert_eq!(parse_sequence("core_00001.lua"), Some(1));
        assert_eq!(parse_sequence("core_42.sql"), Some(42));
        assert_eq!(parse_sequence("multi_part_name_000123.lua"), Some(123));
    }

    #[test]
    fn test_parse_sequence_malformed() {
        assert_eq!(parse_sequence("core_bad.lua"), None);
        assert_eq!(parse_sequence("core.lua"), None);
        assert_eq!(parse_sequence("core_0000001.lua"), None); // 7 digits
        assert_eq!(parse_sequence("core_00001"), None); // no extension
        assert_eq!(parse_sequence("core_.lua"), None); // empty suffix
    }

    #[test]
    fn test_discovery_orders_and_skips() {
        let catalog = MigrationCatalog::with_embedded(&[
            EmbeddedScript {
                name: "foo_00001.ext",
                contents: "A",
            },
            EmbeddedScript {
                name: "foo_00003.ext",
                contents: "C",
            },
            EmbeddedScript {
                name: "foo_00002.ext",
                contents: "B",
            },
            EmbeddedScript {
                name: "foo_bad.ext",
                contents: "X",
            },
        ]);
        let source = MigrationSource::Embedded("foo".to_string());
        let scripts = discover(&source, &catalog).unwrap();
        let sequences: Vec<u32> = scripts.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(scripts.iter().all(|s| s.name != "foo_bad.ext"));
    }

    #[test]
    fn test_discovery_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m_00002.sql"), "CREATE TABLE b (id INTEGER)").unwrap();
        std::fs::write(dir.path().join("m_00001.sql"), "CREATE TABLE a (id INTEGER)").unwrap();
        std::fs::write(dir.path().join("notes.txt.bak"), "skip me").unwrap();

        let source = MigrationSource::Directory(dir.path().to_path_buf());
        let scripts = discover(&source, &MigrationCatalog::new()).unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].name, "m_00001.sql");
        assert_eq!(scripts[1].name, "m_00002.sql");
    }

    #[test]
    fn test_discovery_missing_directory_is_error() {
        let source = MigrationSource::Directory(PathBuf::from("/definitely/not/here"));
        assert!(discover(&source, &MigrationCatalog::new()).is_err());
    }

    #[test]
    fn test_validate_source_reports_lowest() {
        let catalog = MigrationCatalog::with_embedded(&[
            EmbeddedScript {
                name: "audit_00007.lua",
                contents: "A",
            },
            EmbeddedScript {
                name: "audit_00002.lua",
                contents: "B",
            },
        ]);
        let source = MigrationSource::Embedded("audit".to_string());
        assert_eq!(
            validate_source(&source, &catalog).unwrap(),
            "audit_00002.lua"
        );

        let empty = MigrationSource::Embedded("nothing".to_string());
        assert!(validate_source(&empty, &catalog).is_err());
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(
            MigrationSource::parse("embedded:core"),
            MigrationSource::Embedded("core".to_string())
        );
        assert_eq!(
            MigrationSource::parse("/opt/migrations"),
            MigrationSource::Directory(PathBuf::from("/opt/migrations"))
        );
    }
}
