//! In-memory model of a database's tables, columns and keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::{PipelineError, PipelineResult};

/// Whether a column came from the catalog or from sampled documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaConfidence {
    Declared,
    Inferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
    ForeignTable,
    Collection,
}

impl TableKind {
    pub fn label(&self) -> &'static str {
        match self {
            TableKind::Table => "TABLE",
            TableKind::View => "VIEW",
            TableKind::MaterializedView => "MVIEW",
            TableKind::ForeignTable => "FOREIGN",
            TableKind::Collection => "COLLECTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub confidence: SchemaConfidence,
    /// Estimated number of distinct values, when statistics exist.
    pub distinct_estimate: Option<f64>,
}

impl ColumnMeta {
    pub fn declared(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            default: None,
            confidence: SchemaConfidence::Declared,
            distinct_estimate: None,
        }
    }
}

/// `column` references `target_table.target_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnMeta>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexMeta>,
    /// Approximate row count from planner statistics or sampling.
    pub row_count: Option<u64>,
}

impl TableMeta {
    pub fn new(name: &str, kind: TableKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            row_count: None,
        }
    }

    pub fn is_inferred(&self) -> bool {
        self.kind == TableKind::Collection
    }

    pub fn column(&self, name: &str, case_insensitive: bool) -> Option<&ColumnMeta> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| {
                case_insensitive
                    .then(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
                    .flatten()
            })
    }

    /// True when an index (or the primary key) starts with `column`.
    pub fn has_leading_index(&self, column: &str) -> bool {
        self.primary_key
            .first()
            .is_some_and(|c| c.eq_ignore_ascii_case(column))
            || self.indexes.iter().any(|idx| {
                idx.columns
                    .first()
                    .is_some_and(|c| c.eq_ignore_ascii_case(column))
            })
    }

    /// True when `column` alone is a primary key or unique index.
    pub fn is_unique_column(&self, column: &str) -> bool {
        let single = |cols: &[String]| cols.len() == 1 && cols[0].eq_ignore_ascii_case(column);
        single(&self.primary_key)
            || self
                .indexes
                .iter()
                .any(|idx| (idx.unique || idx.primary) && single(&idx.columns))
    }
}

/// Tables keyed by name. Every foreign key targets a table and column that
/// exist in the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaGraph {
    dialect: Dialect,
    tables: BTreeMap<String, TableMeta>,
}

impl SchemaGraph {
    pub fn new(dialect: Dialect, tables: Vec<TableMeta>) -> PipelineResult<Self> {
        let tables: BTreeMap<String, TableMeta> =
            tables.into_iter().map(|t| (t.name.clone(), t)).collect();

        for table in tables.values() {
            for fk in &table.foreign_keys {
                let target_ok = tables
                    .get(&fk.target_table)
                    .is_some_and(|t| t.column(&fk.target_column, false).is_some());
                if !target_ok {
                    return Err(PipelineError::Introspection(format!(
                        "foreign key {}.{} references missing {}.{}",
                        table.name, fk.column, fk.target_table, fk.target_column
                    )));
                }
            }
        }

        Ok(Self { dialect, tables })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableMeta> {
        self.tables.get(name)
    }

    /// Exact match first, then a case-insensitive one when allowed.
    pub fn find_table(&self, name: &str, case_insensitive: bool) -> Option<&TableMeta> {
        self.tables.get(name).or_else(|| {
            case_insensitive
                .then(|| {
                    self.tables
                        .values()
                        .find(|t| t.name.eq_ignore_ascii_case(name))
                })
                .flatten()
        })
    }

    /// Tables one foreign-key hop away, in either direction, sorted.
    pub fn neighbors(&self, name: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if let Some(table) = self.tables.get(name) {
            out.extend(table.foreign_keys.iter().map(|fk| fk.target_table.as_str()));
        }
        for table in self.tables.values() {
            if table.foreign_keys.iter().any(|fk| fk.target_table == name) {
                out.push(&table.name);
            }
        }
        out.retain(|t| *t != name);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// A foreign key linking `a` and `b`, as `(a_column, b_column)`.
    pub fn join_key(&self, a: &str, b: &str) -> Option<(String, String)> {
        let forward = self.tables.get(a).and_then(|t| {
            t.foreign_keys
                .iter()
                .find(|fk| fk.target_table == b)
                .map(|fk| (fk.column.clone(), fk.target_column.clone()))
        });
        forward.or_else(|| {
            self.tables.get(b).and_then(|t| {
                t.foreign_keys
                    .iter()
                    .find(|fk| fk.target_table == a)
                    .map(|fk| (fk.target_column.clone(), fk.column.clone()))
            })
        })
    }
}
