//! Integration tests for migration discovery and execution semantics.

use async_trait::async_trait;
use dbtier::engine::{
    ConnectParams, ConnectionHandle, Engine, EngineDescriptor, SqliteEngine,
};
use dbtier::error::{DbError, DbResult};
use dbtier::migrate::{
    self, EmbeddedScript, MigrationCatalog, MigrationRunner, MigrationScript, MigrationSource,
    ScriptParams, TemplateInterpreter,
};
use dbtier::models::{EngineKind, QueryRequest, QueryResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PARAMS: ScriptParams<'static> = ScriptParams {
    engine: "db2",
    design: "core",
    schema: "main",
};

/// Discovery over a mixed set of names yields ascending sequence order and
/// silently skips the malformed entry.
#[test]
fn test_discovery_order_and_skip() {
    let catalog = MigrationCatalog::with_embedded(&[
        EmbeddedScript {
            name: "foo_00001.ext",
            contents: "one",
        },
        EmbeddedScript {
            name: "foo_00003.ext",
            contents: "three",
        },
        EmbeddedScript {
            name: "foo_00002.ext",
            contents: "two",
        },
        EmbeddedScript {
            name: "foo_bad.ext",
            contents: "never",
        },
    ]);
    let scripts =
        migrate::discover(&MigrationSource::Embedded("foo".into()), &catalog).unwrap();
    let order: Vec<u32> = scripts.iter().map(|s| s.sequence).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(scripts.len(), 3);
}

/// An engine without native multi-statement transactions, instrumented to
/// record every statement it is asked to run and to fail on demand.
struct SplittingEngine {
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Engine for SplittingEngine {
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
        Ok(())
    }

    async fn connect(
        &self,
        _params: &ConnectParams,
        _designator: &str,
        _cache_capacity: usize,
    ) -> DbResult<ConnectionHandle> {
        Err(DbError::internal("not used in this test"))
    }

    async fn disconnect(&self, _handle: &mut ConnectionHandle) -> DbResult<()> {
        Ok(())
    }

    async fn health_check(&self, _handle: &mut ConnectionHandle) -> bool {
        true
    }

    async fn run_statement(
        &self,
        _handle: &mut ConnectionHandle,
        sql: &str,
        _timeout: Duration,
    ) -> DbResult<u64> {
        self.executed.lock().unwrap().push(sql.to_string());
        if sql.contains("BOOM") {
            return Err(DbError::database("simulated failure", None, ""));
        }
        Ok(0)
    }

    async fn execute_query(
        &self,
        _handle: &mut ConnectionHandle,
        _request: &QueryRequest,
    ) -> QueryResult {
        QueryResult::failure("not used in this test", 0)
    }
}

async fn sqlite_handle() -> ConnectionHandle {
    // A real handle to satisfy the runner; the instrumented engine never
    // touches its native connection
    SqliteEngine::new()
        .connect(
            &ConnectParams::parse(EngineKind::SQLite, "sqlite://"),
            "migration-test",
            8,
        )
        .await
        .unwrap()
}

fn script(name: &str, sequence: u32, contents: &str) -> MigrationScript {
    MigrationScript {
        name: name.to_string(),
        sequence,
        contents: contents.to_string(),
    }
}

/// A mid-run statement failure rolls back that script and aborts every
/// later-numbered script in the run.
#[tokio::test]
async fn test_split_execution_halts_on_statement_failure() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let engine = SplittingEngine {
        executed: Arc::clone(&executed),
    };
    let interpreter = TemplateInterpreter;
    let runner = MigrationRunner::new(&engine, &interpreter);
    let mut handle = sqlite_handle().await;

    let scripts = vec![
        script("m_00001.lua", 1, "CREATE TABLE first (id INTEGER)"),
        script(
            "m_00002.lua",
            2,
            "INSERT INTO first VALUES (1)\n--<statement>--\nBOOM\n--<statement>--\nINSERT INTO first VALUES (3)",
        ),
        script("m_00003.lua", 3, "CREATE TABLE never_created (id INTEGER)"),
    ];

    let err = runner.run(&mut handle, &scripts, &PARAMS).await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("m_00002.lua"), "wrong script blamed: {text}");

    let log = executed.lock().unwrap().clone();
    // Script 1 committed
    assert!(log.iter().any(|s| s.contains("first")));
    assert_eq!(log.iter().filter(|s| *s == "COMMIT").count(), 1);
    // Script 2 rolled back after the failing statement
    assert!(log.contains(&"ROLLBACK".to_string()));
    // The statement after the failure never ran
    assert!(!log.iter().any(|s| s.contains("VALUES (3)")));
    // Script 3 never ran
    assert!(!log.iter().any(|s| s.contains("never_created")));
}

/// The failure report names the statement position within the script.
#[tokio::test]
async fn test_failure_identifies_statement_index() {
    let engine = SplittingEngine {
        executed: Arc::new(Mutex::new(Vec::new())),
    };
    let interpreter = TemplateInterpreter;
    let runner = MigrationRunner::new(&engine, &interpreter);
    let mut handle = sqlite_handle().await;

    let scripts = vec![script(
        "m_00001.lua",
        1,
        "OK\n--<statement>--\nBOOM",
    )];
    let err = runner.run(&mut handle, &scripts, &PARAMS).await.unwrap_err();
    match err {
        DbError::Migration {
            script, statement, ..
        } => {
            assert_eq!(script, "m_00001.lua");
            assert_eq!(statement, Some(2));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// The native-transaction path applies a whole multi-statement script as
/// one unit against a real SQLite database.
#[tokio::test]
async fn test_native_transaction_path_applies_unit() {
    let engine = SqliteEngine::new();
    let interpreter = TemplateInterpreter;
    let runner = MigrationRunner::new(&engine, &interpreter);
    let mut handle = sqlite_handle().await;

    let scripts = vec![script(
        "core_00001.sql",
        1,
        "CREATE TABLE a (id INTEGER)\n--<statement>--\nCREATE TABLE b (id INTEGER)",
    )];
    let params = ScriptParams {
        engine: "sqlite",
        design: "core",
        schema: "main",
    };
    let applied = runner.run(&mut handle, &scripts, &params).await.unwrap();
    assert_eq!(applied, 1);

    let check = engine
        .execute_query(
            &mut handle,
            &QueryRequest::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            ),
        )
        .await;
    assert!(check.success);
    let names: Vec<_> = check.rows.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![serde_json::json!("a"), serde_json::json!("b")]);
}
