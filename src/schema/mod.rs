//! Schema introspection and the in-memory schema graph.

mod catalog;
mod document;
mod graph;
mod introspect;

pub use graph::{
    ColumnMeta, ForeignKey, IndexMeta, SchemaConfidence, SchemaGraph, TableKind, TableMeta,
};
pub use introspect::introspect;
