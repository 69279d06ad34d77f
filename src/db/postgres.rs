use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Pool, PoolError};
use serde_json::Value;
use tokio_postgres::types::Type;
use tokio_postgres::Row;
use tracing::debug;

use super::connection::{create_client_pool, ConnectionConfig};
use super::handle::{DbError, Record, RelationalConnection};
use crate::dialect::Dialect;

/// PostgreSQL backend over a `deadpool-postgres` pool.
#[derive(Clone)]
pub struct PgConnection {
    pool: Pool,
}

impl PgConnection {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &ConnectionConfig) -> anyhow::Result<Self> {
        Ok(Self::new(create_client_pool(config).await?))
    }
}

#[async_trait]
impl RelationalConnection for PgConnection {
    fn backend(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&self, sql: &str) -> Result<Vec<Record>, DbError> {
        let client = self.pool.get().await.map_err(pool_error)?;
        debug!(sql, "postgres query");
        let rows = client.query(sql, &[]).await.map_err(classify_error)?;
        Ok(rows.iter().map(row_to_record).collect())
    }
}

fn pool_error(err: PoolError) -> DbError {
    match err {
        PoolError::Backend(e) => classify_error(e),
        other => DbError::Unreachable(other.to_string()),
    }
}

fn classify_error(err: tokio_postgres::Error) -> DbError {
    match err.code() {
        Some(state) => classify_sqlstate(state.code(), err.to_string()),
        None if err.is_closed() => DbError::Unreachable(err.to_string()),
        None => DbError::Malformed(err.to_string()),
    }
}

fn classify_sqlstate(code: &str, message: String) -> DbError {
    match code.get(..2) {
        // Class 08: Connection Exception, 57: Operator Intervention (shutdown)
        Some("08") | Some("57") => DbError::Unreachable(message),
        // Class 22: Data Exception
        Some("22") => DbError::Malformed(message),
        _ => DbError::Rejected(message),
    }
}

fn row_to_record(row: &Row) -> Record {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| (col.name().to_string(), extract_value(row, idx, col.type_())))
        .collect()
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T>(row: &'a Row, idx: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::from),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).map(|f| Value::from(f as f64)),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::from),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get::<String>(row, idx).map(Value::from)
        }
        Type::DATE => get::<NaiveDate>(row, idx).map(|d| Value::from(d.to_string())),
        Type::TIME => get::<NaiveTime>(row, idx).map(|t| Value::from(t.to_string())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(|t| Value::from(t.to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(|t| Value::from(t.to_rfc3339())),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::TEXT_ARRAY | Type::NAME_ARRAY | Type::VARCHAR_ARRAY => {
            get::<Vec<String>>(row, idx).map(Value::from)
        }
        // NUMERIC and other types without a decoder read as text when possible
        _ => get::<String>(row, idx).map(Value::from),
    };
    value.unwrap_or(Value::Null)
}
