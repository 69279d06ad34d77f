//! Catalog queries for the relational backends.
//!
//! Connections take plain SQL text, so names are inlined as escaped string
//! literals. Every query aliases its output columns so row parsing is
//! backend-independent.

use serde_json::Value;

use super::graph::{ColumnMeta, ForeignKey, IndexMeta, SchemaConfidence, TableKind};
use crate::db::{DbError, Record, RecordExt};
use crate::dialect::Dialect;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Catalog {
    Postgres { schema: String },
    MySql { schema: Option<String> },
    Sqlite,
}

/// One row of the table listing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TableListing {
    pub name: String,
    pub kind: TableKind,
    pub row_count: Option<u64>,
}

impl Catalog {
    /// `schema` is the configured schema or database; empty means backend default.
    pub fn for_backend(dialect: Dialect, schema: &str) -> Option<Self> {
        match dialect {
            Dialect::Postgres => Some(Catalog::Postgres {
                schema: if schema.is_empty() {
                    "public".to_string()
                } else {
                    schema.to_string()
                },
            }),
            Dialect::MySql => Some(Catalog::MySql {
                schema: (!schema.is_empty()).then(|| schema.to_string()),
            }),
            Dialect::Sqlite => Some(Catalog::Sqlite),
            Dialect::MongoDb => None,
        }
    }

    fn mysql_schema(schema: &Option<String>) -> String {
        schema
            .as_deref()
            .map(literal)
            .unwrap_or_else(|| "DATABASE()".to_string())
    }

    pub fn list_tables(&self) -> String {
        match self {
            Catalog::Postgres { schema } => format!(
                r#"
                SELECT
                    c.relname::text AS name,
                    CASE c.relkind
                        WHEN 'r' THEN 'table'
                        WHEN 'p' THEN 'table'
                        WHEN 'v' THEN 'view'
                        WHEN 'm' THEN 'materialized_view'
                        WHEN 'f' THEN 'foreign_table'
                        ELSE 'other'
                    END AS kind,
                    GREATEST(c.reltuples, 0)::bigint AS row_count
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = {}
                  AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
                  AND NOT c.relispartition
                ORDER BY c.relname
                "#,
                literal(schema)
            ),
            Catalog::MySql { schema } => format!(
                r#"
                SELECT
                    table_name AS name,
                    CASE table_type WHEN 'VIEW' THEN 'view' ELSE 'table' END AS kind,
                    table_rows AS row_count
                FROM information_schema.tables
                WHERE table_schema = {}
                ORDER BY table_name
                "#,
                Self::mysql_schema(schema)
            ),
            Catalog::Sqlite => r#"
                SELECT name, type AS kind
                FROM sqlite_master
                WHERE type IN ('table', 'view')
                  AND name NOT LIKE 'sqlite_%'
                ORDER BY name
                "#
            .to_string(),
        }
    }

    pub fn columns(&self, table: &str) -> String {
        match self {
            Catalog::Postgres { schema } => format!(
                r#"
                SELECT
                    c.column_name::text AS name,
                    c.data_type::text AS data_type,
                    c.is_nullable = 'YES' AS nullable,
                    COALESCE(tc.constraint_type = 'PRIMARY KEY', false) AS is_primary_key,
                    c.column_default::text AS default_value
                FROM information_schema.columns c
                LEFT JOIN information_schema.key_column_usage kcu
                    ON c.table_schema = kcu.table_schema
                    AND c.table_name = kcu.table_name
                    AND c.column_name = kcu.column_name
                LEFT JOIN information_schema.table_constraints tc
                    ON kcu.constraint_name = tc.constraint_name
                    AND kcu.table_schema = tc.table_schema
                    AND tc.constraint_type = 'PRIMARY KEY'
                WHERE c.table_schema = {} AND c.table_name = {}
                ORDER BY c.ordinal_position
                "#,
                literal(schema),
                literal(table)
            ),
            Catalog::MySql { schema } => format!(
                r#"
                SELECT
                    column_name AS name,
                    column_type AS data_type,
                    is_nullable = 'YES' AS nullable,
                    column_key = 'PRI' AS is_primary_key,
                    column_default AS default_value
                FROM information_schema.columns
                WHERE table_schema = {} AND table_name = {}
                ORDER BY ordinal_position
                "#,
                Self::mysql_schema(schema),
                literal(table)
            ),
            Catalog::Sqlite => format!(
                r#"
                SELECT
                    name,
                    type AS data_type,
                    "notnull" = 0 AS nullable,
                    pk > 0 AS is_primary_key,
                    dflt_value AS default_value
                FROM pragma_table_info({})
                ORDER BY cid
                "#,
                literal(table)
            ),
        }
    }

    pub fn foreign_keys(&self, table: &str) -> String {
        match self {
            Catalog::Postgres { schema } => format!(
                r#"
                SELECT
                    a.attname::text AS column_name,
                    ft.relname::text AS target_table,
                    fa.attname::text AS target_column
                FROM pg_catalog.pg_constraint con
                JOIN pg_catalog.pg_class t ON t.oid = con.conrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                JOIN pg_catalog.pg_class ft ON ft.oid = con.confrelid
                CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(src, dst)
                JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.src
                JOIN pg_catalog.pg_attribute fa ON fa.attrelid = con.confrelid AND fa.attnum = k.dst
                WHERE con.contype = 'f' AND n.nspname = {} AND t.relname = {}
                ORDER BY con.conname, a.attnum
                "#,
                literal(schema),
                literal(table)
            ),
            Catalog::MySql { schema } => format!(
                r#"
                SELECT
                    column_name AS column_name,
                    referenced_table_name AS target_table,
                    referenced_column_name AS target_column
                FROM information_schema.key_column_usage
                WHERE table_schema = {} AND table_name = {}
                  AND referenced_table_name IS NOT NULL
                ORDER BY constraint_name, ordinal_position
                "#,
                Self::mysql_schema(schema),
                literal(table)
            ),
            Catalog::Sqlite => format!(
                r#"
                SELECT "from" AS column_name, "table" AS target_table, "to" AS target_column
                FROM pragma_foreign_key_list({})
                ORDER BY id, seq
                "#,
                literal(table)
            ),
        }
    }

    pub fn indexes(&self, table: &str) -> String {
        match self {
            Catalog::Postgres { schema } => format!(
                r#"
                SELECT
                    i.relname::text AS name,
                    string_agg(a.attname::text, ',' ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS columns,
                    ix.indisunique AS is_unique,
                    ix.indisprimary AS is_primary
                FROM pg_catalog.pg_index ix
                JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
                JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
                WHERE n.nspname = {} AND t.relname = {}
                GROUP BY i.relname, ix.indisunique, ix.indisprimary
                ORDER BY i.relname
                "#,
                literal(schema),
                literal(table)
            ),
            Catalog::MySql { schema } => format!(
                r#"
                SELECT
                    index_name AS name,
                    GROUP_CONCAT(column_name ORDER BY seq_in_index SEPARATOR ',') AS columns,
                    MIN(non_unique) = 0 AS is_unique,
                    index_name = 'PRIMARY' AS is_primary
                FROM information_schema.statistics
                WHERE table_schema = {} AND table_name = {}
                GROUP BY index_name
                ORDER BY index_name
                "#,
                Self::mysql_schema(schema),
                literal(table)
            ),
            Catalog::Sqlite => format!(
                r#"
                SELECT
                    il.name AS name,
                    (SELECT group_concat(ii.name, ',')
                       FROM (SELECT name FROM pragma_index_info(il.name) ORDER BY seqno) ii) AS columns,
                    il."unique" AS is_unique,
                    il.origin = 'pk' AS is_primary
                FROM pragma_index_list({}) il
                ORDER BY il.name
                "#,
                literal(table)
            ),
        }
    }

    /// Per-column distinct-value estimates, when the backend keeps them.
    pub fn column_stats(&self, table: &str) -> Option<String> {
        match self {
            Catalog::Postgres { schema } => Some(format!(
                r#"
                SELECT attname::text AS column_name, n_distinct::float8 AS n_distinct
                FROM pg_catalog.pg_stats
                WHERE schemaname = {} AND tablename = {}
                "#,
                literal(schema),
                literal(table)
            )),
            Catalog::MySql { schema } => Some(format!(
                r#"
                SELECT column_name AS column_name, MAX(cardinality) AS n_distinct
                FROM information_schema.statistics
                WHERE table_schema = {} AND table_name = {} AND seq_in_index = 1
                GROUP BY column_name
                "#,
                Self::mysql_schema(schema),
                literal(table)
            )),
            Catalog::Sqlite => None,
        }
    }

    /// Row count query for backends whose listing carries no estimate.
    pub fn row_count(&self, table: &str) -> Option<String> {
        match self {
            Catalog::Sqlite => Some(format!(
                "SELECT COUNT(*) AS row_count FROM \"{}\"",
                table.replace('"', "\"\"")
            )),
            _ => None,
        }
    }
}

/// Quote a value as a SQL string literal.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn required_text(row: &Record, key: &str) -> Result<String, DbError> {
    row.text(key)
        .ok_or_else(|| DbError::Malformed(format!("catalog row without `{key}`: {}", Value::Object(row.clone()))))
}

pub(crate) fn parse_table_list(rows: &[Record]) -> Result<Vec<TableListing>, DbError> {
    rows.iter()
        .map(|row| {
            let kind = match row.text("kind").as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("view") => TableKind::View,
                Some("materialized_view") => TableKind::MaterializedView,
                Some("foreign_table") => TableKind::ForeignTable,
                _ => TableKind::Table,
            };
            Ok(TableListing {
                name: required_text(row, "name")?,
                kind,
                row_count: row.int("row_count").map(|n| n.max(0) as u64),
            })
        })
        .collect()
}

/// Columns in ordinal order plus the primary-key column list.
pub(crate) fn parse_columns(rows: &[Record]) -> Result<(Vec<ColumnMeta>, Vec<String>), DbError> {
    let mut columns = Vec::with_capacity(rows.len());
    let mut primary_key = Vec::new();
    for row in rows {
        let name = required_text(row, "name")?;
        if row.flag("is_primary_key") {
            primary_key.push(name.clone());
        }
        columns.push(ColumnMeta {
            data_type: row.text("data_type").unwrap_or_default().to_lowercase(),
            nullable: row.flag("nullable"),
            default: row.text("default_value"),
            confidence: SchemaConfidence::Declared,
            distinct_estimate: None,
            name,
        });
    }
    Ok((columns, primary_key))
}

/// Foreign keys; `target_column` is empty when the backend left it implicit.
pub(crate) fn parse_foreign_keys(rows: &[Record]) -> Result<Vec<ForeignKey>, DbError> {
    rows.iter()
        .map(|row| {
            Ok(ForeignKey {
                column: required_text(row, "column_name")?,
                target_table: required_text(row, "target_table")?,
                target_column: row.text("target_column").unwrap_or_default(),
            })
        })
        .collect()
}

pub(crate) fn parse_indexes(rows: &[Record]) -> Result<Vec<IndexMeta>, DbError> {
    rows.iter()
        .map(|row| {
            let columns = row
                .text("columns")
                .map(|c| {
                    c.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            Ok(IndexMeta {
                name: required_text(row, "name")?,
                columns,
                unique: row.flag("is_unique"),
                primary: row.flag("is_primary"),
            })
        })
        .collect()
}

/// Apply distinct estimates. PostgreSQL reports negative values as a
/// fraction of the row count.
pub(crate) fn apply_column_stats(columns: &mut [ColumnMeta], rows: &[Record], row_count: Option<u64>) {
    for row in rows {
        let (Some(name), Some(n_distinct)) = (row.text("column_name"), row.float("n_distinct")) else {
            continue;
        };
        let estimate = if n_distinct < 0.0 {
            match row_count {
                Some(rows) => -n_distinct * rows as f64,
                None => continue,
            }
        } else {
            n_distinct
        };
        if let Some(col) = columns.iter_mut().find(|c| c.name == name) {
            col.distinct_estimate = Some(estimate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Record> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_names_are_escaped() {
        let catalog = Catalog::for_backend(Dialect::Postgres, "").unwrap();
        let sql = catalog.columns("o'brien");
        assert!(sql.contains("c.table_schema = 'public' AND c.table_name = 'o''brien'"));
        assert_eq!(
            Catalog::Sqlite.row_count("we\"ird").unwrap(),
            "SELECT COUNT(*) AS row_count FROM \"we\"\"ird\""
        );
    }

    #[test]
    fn test_mysql_defaults_to_current_database() {
        let catalog = Catalog::for_backend(Dialect::MySql, "").unwrap();
        assert!(catalog.list_tables().contains("table_schema = DATABASE()"));
        let catalog = Catalog::for_backend(Dialect::MySql, "shop").unwrap();
        assert!(catalog.list_tables().contains("table_schema = 'shop'"));
        assert!(Catalog::for_backend(Dialect::MongoDb, "").is_none());
    }

    #[test]
    fn test_parse_table_list() {
        let parsed = parse_table_list(&rows(json!([
            {"name": "orders", "kind": "table", "row_count": 50000},
            {"name": "recent", "kind": "VIEW", "row_count": "-1"},
            {"name": "mv", "kind": "materialized_view"}
        ])))
        .unwrap();
        assert_eq!(parsed[0].row_count, Some(50_000));
        assert_eq!(parsed[1].kind, TableKind::View);
        assert_eq!(parsed[1].row_count, Some(0));
        assert_eq!(parsed[2].kind, TableKind::MaterializedView);
        assert_eq!(parsed[2].row_count, None);

        let err = parse_table_list(&rows(json!([{"kind": "table"}]))).unwrap_err();
        assert!(matches!(err, DbError::Malformed(_)));
    }

    #[test]
    fn test_parse_columns_collects_primary_key() {
        let (columns, pk) = parse_columns(&rows(json!([
            {"name": "id", "data_type": "INTEGER", "nullable": 0, "is_primary_key": 1},
            {"name": "email", "data_type": "text", "nullable": 1, "is_primary_key": 0, "default_value": null}
        ])))
        .unwrap();
        assert_eq!(pk, vec!["id"]);
        assert_eq!(columns[0].data_type, "integer");
        assert!(!columns[0].nullable);
        assert!(columns[1].nullable);
        assert_eq!(columns[1].default, None);
    }

    #[test]
    fn test_parse_indexes_splits_columns() {
        let indexes = parse_indexes(&rows(json!([
            {"name": "orders_pkey", "columns": "id", "is_unique": true, "is_primary": true},
            {"name": "idx_status_created", "columns": "status,created_at", "is_unique": false, "is_primary": false}
        ])))
        .unwrap();
        assert!(indexes[0].primary);
        assert_eq!(indexes[1].columns, vec!["status", "created_at"]);
    }

    #[test]
    fn test_negative_n_distinct_scales_with_rows() {
        let (mut columns, _) = parse_columns(&rows(json!([
            {"name": "id", "data_type": "integer"},
            {"name": "status", "data_type": "text"}
        ])))
        .unwrap();
        apply_column_stats(
            &mut columns,
            &rows(json!([
                {"column_name": "id", "n_distinct": -1.0},
                {"column_name": "status", "n_distinct": 4.0}
            ])),
            Some(1000),
        );
        assert_eq!(columns[0].distinct_estimate, Some(1000.0));
        assert_eq!(columns[1].distinct_estimate, Some(4.0));
    }
}
