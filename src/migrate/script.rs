//! Migration script interpretation.
//!
//! The scripting sublanguage migrations are authored in is deliberately
//! opaque to the runner: an interpreter takes template parameters and hands
//! back one generated SQL string, with statements separated by a fixed
//! delimiter the interpreter understands. The stock interpreter does plain
//! placeholder substitution; richer interpreters plug in behind the same
//! trait.

use crate::error::{DbError, DbResult};

/// Fixed marker separating statements in generated SQL. A script that emits
/// a single statement needs no delimiter at all.
pub const STATEMENT_DELIMITER: &str = "--<statement>--";

/// Template parameters handed to the interpreter for each script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptParams<'a> {
    /// Target engine name, e.g. "sqlite".
    pub engine: &'a str,
    /// Design/migration-set name.
    pub design: &'a str,
    /// Schema the script should target.
    pub schema: &'a str,
}

/// Interpreter output: the generated SQL plus its statement count.
#[derive(Debug, Clone)]
pub struct RenderedSql {
    pub sql: String,
    pub statement_count: usize,
}

/// Renders script source into executable SQL.
pub trait ScriptInterpreter: Send + Sync {
    fn render(&self, source: &str, params: &ScriptParams<'_>) -> DbResult<RenderedSql>;
}

/// Stock interpreter: the script body is SQL with `${engine}`, `${design}`,
/// and `${schema}` placeholders.
pub struct TemplateInterpreter;

impl ScriptInterpreter for TemplateInterpreter {
    fn render(&self, source: &str, params: &ScriptParams<'_>) -> DbResult<RenderedSql> {
        if source.trim().is_empty() {
            return Err(DbError::invalid_input("script rendered no SQL"));
        }
        let sql = source
            .replace("${engine}", params.engine)
            .replace("${design}", params.design)
            .replace("${schema}", params.schema);
        let statement_count = split_statements(&sql).len();
        Ok(RenderedSql {
            sql,
            statement_count,
        })
    }
}

/// Split generated SQL on the statement delimiter, dropping empty segments.
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(STATEMENT_DELIMITER)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: ScriptParams<'static> = ScriptParams {
        engine: "sqlite",
        design: "core",
        schema: "main",
    };

    #[test]
    fn test_render_substitutes_placeholders() {
        let rendered = TemplateInterpreter
            .render("CREATE TABLE ${schema}.jobs (id INTEGER)", &PARAMS)
            .unwrap();
        assert_eq!(rendered.sql, "CREATE TABLE main.jobs (id INTEGER)");
        assert_eq!(rendered.statement_count, 1);
    }

    #[test]
    fn test_render_counts_statements() {
        let source = format!(
            "CREATE TABLE a (id INTEGER)\n{STATEMENT_DELIMITER}\nCREATE TABLE b (id INTEGER)"
        );
        let rendered = TemplateInterpreter.render(&source, &PARAMS).unwrap();
        assert_eq!(rendered.statement_count, 2);
    }

    #[test]
    fn test_render_empty_script_is_error() {
        assert!(TemplateInterpreter.render("   \n", &PARAMS).is_err());
    }

    #[test]
    fn test_split_statements_drops_blanks() {
        let sql = format!("A{STATEMENT_DELIMITER}{STATEMENT_DELIMITER}  B  {STATEMENT_DELIMITER}");
        assert_eq!(split_statements(&sql), vec!["A", "B"]);
    }

    #[test]
    fn test_split_without_delimiter_is_one_statement() {
        assert_eq!(split_statements("SELECT 1").len(), 1);
    }
}
