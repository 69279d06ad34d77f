//! Target dialects and adaptation of validated statements to them.

mod document;
mod rules;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use document::DocumentQuerySpec;
pub use rules::DialectRules;

use crate::ast::compiler;
use crate::error::{PipelineError, PipelineResult};
use crate::validate::{StatementKind, ValidatedQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
    MongoDb,
}

impl Dialect {
    pub fn rules(self) -> &'static DialectRules {
        DialectRules::for_dialect(self)
    }

    pub fn is_relational(self) -> bool {
        !matches!(self, Dialect::MongoDb)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::Postgres => "PostgreSQL",
            Dialect::MySql => "MySQL",
            Dialect::Sqlite => "SQLite",
            Dialect::MongoDb => "MongoDB",
        };
        f.write_str(name)
    }
}

/// Statement rendered for a concrete backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "form", content = "query", rename_all = "lowercase")]
pub enum AdaptedQuery {
    Sql(String),
    Document(DocumentQuerySpec),
}

impl AdaptedQuery {
    pub fn as_sql(&self) -> Option<&str> {
        match self {
            AdaptedQuery::Sql(sql) => Some(sql),
            AdaptedQuery::Document(_) => None,
        }
    }
}

/// Rewrite `validated` for `target`. Mutating and DDL statements need
/// `confirmed`.
pub(crate) fn adapt(
    validated: &ValidatedQuery,
    target: Dialect,
    confirmed: bool,
) -> PipelineResult<AdaptedQuery> {
    if validated.kind() != StatementKind::ReadOnly && !confirmed {
        return Err(PipelineError::unsafe_statement(
            format!(
                "{} statement requires explicit confirmation",
                validated.kind()
            ),
            validated.sql(),
        ));
    }

    let adapted = match target {
        Dialect::MongoDb => {
            if validated.statements().len() > 1 {
                return Err(PipelineError::unsupported("multiple statements", target));
            }
            AdaptedQuery::Document(document::to_document_query(validated.statement())?)
        }
        relational => {
            let rendered = validated
                .statements()
                .iter()
                .map(|statement| compiler::compile_for(statement, relational.rules()))
                .collect::<PipelineResult<Vec<_>>>()?;
            AdaptedQuery::Sql(rendered.join(";\n"))
        }
    };
    debug!(%target, ?adapted, "Adapted statement");
    Ok(adapted)
}
