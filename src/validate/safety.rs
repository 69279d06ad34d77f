//! Lexical and denylist checks.

use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use crate::ast::parser::grammar;
use crate::dialect::Dialect;
use crate::error::{PipelineError, PipelineResult};

/// Schemas whose relations are never reachable from generated SQL.
const DENIED_SCHEMAS: &[&str] = &[
    "pg_catalog",
    "pg_toast",
    "information_schema",
    "mysql",
    "performance_schema",
    "sys",
];

/// Relation name prefixes owned by the backend itself.
const DENIED_RELATION_PREFIXES: &[&str] = &["pg_", "sqlite_", "system."];

const DENIED_FUNCTIONS: &[&str] = &[
    "BENCHMARK",
    "CURRENT_SETTING",
    "DBLINK",
    "DBLINK_EXEC",
    "GET_LOCK",
    "LOAD_EXTENSION",
    "LOAD_FILE",
    "LO_EXPORT",
    "LO_IMPORT",
    "QUERY_TO_XML",
    "READFILE",
    "SET_CONFIG",
    "SLEEP",
    "SYS_EVAL",
    "SYS_EXEC",
    "WRITEFILE",
];

/// Table functions that may appear in FROM, with their fixed output
/// columns. Functions without fixed columns yield one column named after
/// the relation.
const TABLE_FUNCTIONS: &[(&str, &[&str])] = &[
    ("generate_series", &[]),
    ("unnest", &[]),
    (
        "json_each",
        &["key", "value", "type", "atom", "id", "parent", "fullkey", "path"],
    ),
    ("jsonb_each", &["key", "value"]),
    ("json_array_elements", &["value"]),
    ("jsonb_array_elements", &["value"]),
];

/// Tokenize `sql`, refuse comments and return the number of statements.
pub(super) fn scan(sql: &str, dialect: Dialect) -> PipelineResult<usize> {
    let grammar = grammar(dialect);
    let tokens = Tokenizer::new(grammar.as_ref(), sql)
        .tokenize()
        .map_err(|e| PipelineError::Syntax {
            message: e.to_string(),
            statement: sql.to_string(),
        })?;

    let mut statements = 0;
    let mut pending = false;
    for token in &tokens {
        match token {
            Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                return Err(PipelineError::unsafe_statement(
                    "comment injection: SQL comments are not allowed",
                    sql,
                ));
            }
            Token::Whitespace(_) => {}
            Token::SemiColon => {
                if pending {
                    statements += 1;
                    pending = false;
                }
            }
            _ => pending = true,
        }
    }
    if pending {
        statements += 1;
    }
    Ok(statements)
}

/// Words of a DDL statement that name system objects.
pub(super) fn denied_word(sql: &str, dialect: Dialect) -> Option<String> {
    let grammar = grammar(dialect);
    let tokens = Tokenizer::new(grammar.as_ref(), sql).tokenize().ok()?;
    tokens.into_iter().find_map(|token| match token {
        Token::Word(word) if denied_relation(None, &word.value) => Some(word.value),
        _ => None,
    })
}

pub(super) fn denied_relation(schema: Option<&str>, name: &str) -> bool {
    let is_denied_schema = |s: &str| DENIED_SCHEMAS.iter().any(|d| d.eq_ignore_ascii_case(s));
    if schema.is_some_and(is_denied_schema) || is_denied_schema(name) {
        return true;
    }
    let full = match schema {
        Some(schema) => format!("{schema}.{name}"),
        None => name.to_string(),
    };
    [name, full.as_str()].iter().any(|candidate| {
        let lower = candidate.to_ascii_lowercase();
        DENIED_RELATION_PREFIXES.iter().any(|p| lower.starts_with(p))
    })
}

/// `name` is upper-cased and may carry a schema qualifier.
pub(super) fn denied_function(name: &str, extra: &[String]) -> bool {
    let mut parts = name.rsplit('.');
    let base = parts.next().unwrap_or(name).trim_matches('"');
    if parts.any(|schema| denied_relation(Some(schema.trim_matches('"')), "")) {
        return true;
    }
    base.starts_with("PG_")
        || DENIED_FUNCTIONS.contains(&base)
        || extra.iter().any(|f| f.eq_ignore_ascii_case(base))
}

/// Fixed output columns of an allowed table function, `None` when the
/// function may not appear in FROM. Qualified names are never allowed.
pub(super) fn table_function_columns(name: &str) -> Option<&'static [&'static str]> {
    TABLE_FUNCTIONS
        .iter()
        .find(|(allowed, _)| allowed.eq_ignore_ascii_case(name))
        .map(|(_, columns)| *columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_rejected() {
        for sql in [
            "SELECT 1 -- drop everything",
            "SELECT /* hidden */ 1",
            "SELECT 1; -- trailing",
        ] {
            let err = scan(sql, Dialect::Postgres).unwrap_err();
            assert!(matches!(err, PipelineError::UnsafeStatement { .. }), "{sql}");
        }
    }

    #[test]
    fn test_mysql_hash_comment_rejected() {
        let err = scan("SELECT 1 # note", Dialect::MySql).unwrap_err();
        assert!(matches!(err, PipelineError::UnsafeStatement { .. }));
    }

    #[test]
    fn test_comment_markers_inside_strings_are_fine() {
        assert_eq!(scan("SELECT '-- not a comment'", Dialect::Postgres).unwrap(), 1);
    }

    #[test]
    fn test_statement_count() {
        assert_eq!(scan("SELECT 1", Dialect::Sqlite).unwrap(), 1);
        assert_eq!(scan("SELECT 1;", Dialect::Sqlite).unwrap(), 1);
        assert_eq!(scan("SELECT 1; SELECT 2", Dialect::Sqlite).unwrap(), 2);
        assert_eq!(scan(" ;; ", Dialect::Sqlite).unwrap(), 0);
    }

    #[test]
    fn test_unterminated_string_is_syntax_error() {
        let err = scan("SELECT 'abc", Dialect::Postgres).unwrap_err();
        assert!(matches!(err, PipelineError::Syntax { .. }));
    }

    #[test]
    fn test_denied_relations() {
        assert!(denied_relation(Some("pg_catalog"), "pg_class"));
        assert!(denied_relation(Some("INFORMATION_SCHEMA"), "tables"));
        assert!(denied_relation(None, "pg_user"));
        assert!(denied_relation(None, "sqlite_master"));
        assert!(denied_relation(None, "system.users"));
        assert!(denied_relation(Some("system"), "profile"));
        assert!(!denied_relation(Some("public"), "orders"));
        assert!(!denied_relation(None, "pages"));
    }

    #[test]
    fn test_denied_functions() {
        assert!(denied_function("PG_SLEEP", &[]));
        assert!(denied_function("PG_CATALOG.NOW", &[]));
        assert!(denied_function("SLEEP", &[]));
        assert!(denied_function("MY_UDF", &["my_udf".to_string()]));
        assert!(!denied_function("COUNT", &[]));
        assert!(!denied_function("DATE_TRUNC", &[]));
    }

    #[test]
    fn test_table_functions() {
        assert_eq!(table_function_columns("generate_series"), Some(&[][..]));
        assert_eq!(table_function_columns("JSONB_EACH"), Some(&["key", "value"][..]));
        assert_eq!(table_function_columns("dblink"), None);
        assert_eq!(table_function_columns("pg_catalog.unnest"), None);
    }

    #[test]
    fn test_denied_word_in_ddl() {
        assert_eq!(
            denied_word("DROP TABLE pg_catalog.pg_class", Dialect::Postgres).as_deref(),
            Some("pg_catalog")
        );
        assert_eq!(denied_word("DROP TABLE orders", Dialect::Postgres), None);
    }
}
