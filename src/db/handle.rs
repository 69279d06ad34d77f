//! Connection handles the pipeline consumes.
//!
//! The pipeline never opens connections itself; callers hand it either a
//! relational connection that answers SQL with JSON records, or a document
//! store connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dialect::Dialect;
use crate::error::PipelineError;
use crate::schema::IndexMeta;

/// One result row, keyed by column name in select-list order.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// The backend could not be reached or the session dropped.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend refused the statement (privileges, unknown objects, ...).
    #[error("statement rejected: {0}")]
    Rejected(String),

    #[error("malformed result: {0}")]
    Malformed(String),
}

impl DbError {
    /// Map into the pipeline taxonomy for metadata queries.
    pub(crate) fn into_introspection(self) -> PipelineError {
        match self {
            DbError::Unreachable(msg) => PipelineError::Connection(msg),
            other => PipelineError::Introspection(other.to_string()),
        }
    }
}

#[async_trait]
pub trait RelationalConnection: Send + Sync {
    fn backend(&self) -> Dialect;

    /// Run a read-only statement and return its rows.
    async fn query(&self, sql: &str) -> Result<Vec<Record>, DbError>;
}

/// Field declared by a collection validator (`$jsonSchema`).
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredField {
    pub path: String,
    pub bson_type: String,
    pub required: bool,
}

#[async_trait]
pub trait DocumentConnection: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>, DbError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        limit: usize,
    ) -> Result<Vec<Value>, DbError>;

    async fn declared_fields(&self, collection: &str) -> Result<Vec<DeclaredField>, DbError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexMeta>, DbError>;

    async fn estimated_count(&self, _collection: &str) -> Result<Option<u64>, DbError> {
        Ok(None)
    }
}

#[derive(Clone)]
pub enum ConnectionHandle {
    Relational(Arc<dyn RelationalConnection>),
    Document(Arc<dyn DocumentConnection>),
}

impl ConnectionHandle {
    pub fn dialect(&self) -> Dialect {
        match self {
            ConnectionHandle::Relational(conn) => conn.backend(),
            ConnectionHandle::Document(_) => Dialect::MongoDb,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionHandle({})", self.dialect())
    }
}

/// Lenient typed access to record fields. Backends disagree on whether
/// counts and flags come back as numbers, strings or booleans.
pub(crate) trait RecordExt {
    fn text(&self, key: &str) -> Option<String>;
    fn int(&self, key: &str) -> Option<i64>;
    fn float(&self, key: &str) -> Option<f64>;
    fn flag(&self, key: &str) -> bool;
}

impl RecordExt for Record {
    fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    fn float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "t" | "true" | "YES" | "yes"),
            _ => false,
        }
    }
}
