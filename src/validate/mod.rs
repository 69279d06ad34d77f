//! The trust boundary between model output and everything downstream.
//!
//! A [`ValidatedQuery`] can only be built here: the text has been
//! tokenized and checked for comments and stacked statements, parsed,
//! screened against the system-object and function denylists, classified
//! and checked against policy, and every relation and column reference has
//! resolved in the schema graph.

mod references;
mod safety;

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::ast::{parse_sql_with, Query};
use crate::config::ValidatorConfig;
use crate::dialect::Dialect;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::SchemaGraph;
use crate::translate::CandidateQuery;
use references::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum StatementKind {
    ReadOnly,
    Mutating,
    Ddl,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatementKind::ReadOnly => "read-only",
            StatementKind::Mutating => "mutating",
            StatementKind::Ddl => "DDL",
        })
    }
}

/// A resolved `table.column` reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedQuery {
    statements: Vec<Query>,
    sql: String,
    dialect: Dialect,
    kind: StatementKind,
    tables: BTreeSet<String>,
    columns: BTreeSet<ColumnRef>,
    notes: Vec<String>,
}

impl ValidatedQuery {
    /// The first (usually only) statement, with names in catalog spelling.
    pub fn statement(&self) -> &Query {
        &self.statements[0]
    }

    pub fn statements(&self) -> &[Query] {
        &self.statements
    }

    /// Source text as received.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Grammar the text was parsed with.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    pub fn columns(&self) -> &BTreeSet<ColumnRef> {
        &self.columns
    }

    /// Loose matches against inferred collections.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

pub(crate) fn validate(
    candidate: &CandidateQuery,
    schema: &SchemaGraph,
    config: &ValidatorConfig,
) -> PipelineResult<ValidatedQuery> {
    validate_sql(&candidate.statement, candidate.dialect, schema, config)
}

pub(crate) fn validate_sql(
    sql: &str,
    dialect: Dialect,
    schema: &SchemaGraph,
    config: &ValidatorConfig,
) -> PipelineResult<ValidatedQuery> {
    let sql = sql.trim();
    let syntax = |message: String| PipelineError::Syntax {
        message,
        statement: sql.to_string(),
    };

    let count = safety::scan(sql, dialect)?;
    if count == 0 {
        return Err(syntax("empty statement".to_string()));
    }
    if count > 1 && !config.allow_multi_statement {
        return Err(PipelineError::unsafe_statement(
            format!("found {count} statements; only one is allowed"),
            sql,
        ));
    }

    let parsed = parse_sql_with(sql, dialect).map_err(|e| syntax(e.to_string()))?;
    if parsed.is_empty() {
        return Err(syntax("empty statement".to_string()));
    }

    let case_insensitive = config
        .case_insensitive
        .unwrap_or(schema.dialect().rules().case_insensitive_identifiers);
    let mut resolver = Resolver::new(schema, case_insensitive, &config.denied_functions, sql);

    let mut kind = StatementKind::ReadOnly;
    let mut statements = Vec::with_capacity(parsed.len());
    for mut statement in parsed {
        let statement_kind = classify(&statement).ok_or_else(|| {
            PipelineError::unsafe_statement(
                format!("statement type not allowed: {}", leading_words(&statement)),
                sql,
            )
        })?;
        match statement_kind {
            StatementKind::Mutating if !config.allow_mutating => {
                return Err(PipelineError::unsafe_statement(
                    "mutating statements are disabled",
                    sql,
                ));
            }
            StatementKind::Ddl if !config.allow_ddl => {
                return Err(PipelineError::unsafe_statement(
                    "DDL statements are disabled",
                    sql,
                ));
            }
            _ => {}
        }

        match &statement {
            Query::Ddl(ddl) => {
                if let Some(word) = safety::denied_word(&ddl.sql, dialect) {
                    return Err(PipelineError::unsafe_statement(
                        format!("access to system relation `{word}` is not allowed"),
                        sql,
                    ));
                }
            }
            _ => resolver.resolve_statement(&mut statement)?,
        }
        kind = kind.max(statement_kind);
        statements.push(statement);
    }

    let resolved = resolver.finish();
    for note in &resolved.notes {
        debug!(%note, "loose schema match");
    }
    info!(
        %kind,
        %dialect,
        tables = ?resolved.tables,
        "statement validated"
    );

    Ok(ValidatedQuery {
        statements,
        sql: sql.to_string(),
        dialect,
        kind,
        tables: resolved.tables,
        columns: resolved.columns,
        notes: resolved.notes,
    })
}

/// Top-level statement count; `None` when the text does not tokenize cleanly.
pub(crate) fn statement_count(sql: &str, dialect: Dialect) -> Option<usize> {
    safety::scan(sql, dialect).ok()
}

/// Kind by top-level verb; `None` for statements that are never allowed.
fn classify(statement: &Query) -> Option<StatementKind> {
    match statement {
        Query::Select(_) => Some(StatementKind::ReadOnly),
        Query::With(with) => {
            let mut kind = classify(&with.body)?;
            for cte in &with.ctes {
                kind = kind.max(classify(&cte.query)?);
            }
            Some(kind)
        }
        Query::Insert(_) | Query::Update(_) | Query::Delete(_) => Some(StatementKind::Mutating),
        Query::Ddl(_) => Some(StatementKind::Ddl),
        Query::Raw(_) => None,
    }
}

fn leading_words(statement: &Query) -> String {
    match statement {
        Query::Raw(text) => text.split_whitespace().take(2).collect::<Vec<_>>().join(" "),
        _ => "unknown".to_string(),
    }
}
