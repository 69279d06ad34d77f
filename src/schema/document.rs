//! Field-shape inference for document collections.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::graph::{ColumnMeta, IndexMeta, SchemaConfidence, TableKind, TableMeta};
use crate::db::DeclaredField;

/// Nested objects are flattened into dotted paths up to this depth.
pub(crate) const MAX_DEPTH: usize = 3;

#[derive(Debug, Default)]
struct FieldShape {
    types: BTreeSet<&'static str>,
    present: usize,
    saw_null: bool,
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "double",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn observe(shapes: &mut BTreeMap<String, FieldShape>, prefix: &str, doc: &Value, depth: usize) {
    let Value::Object(map) = doc else { return };
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(_) if depth < MAX_DEPTH => observe(shapes, &path, value, depth + 1),
            _ => {
                let shape = shapes.entry(path).or_default();
                shape.present += 1;
                match value {
                    Value::Null => shape.saw_null = true,
                    other => {
                        shape.types.insert(type_name(other));
                    }
                }
            }
        }
    }
}

/// Infer a collection's columns from sampled documents and the fields its
/// validator declares. Declared fields win over sampled shapes.
pub(crate) fn infer_collection(
    name: &str,
    samples: &[Value],
    declared: &[DeclaredField],
    indexes: Vec<IndexMeta>,
    row_count: Option<u64>,
) -> TableMeta {
    let mut shapes: BTreeMap<String, FieldShape> = BTreeMap::new();
    for doc in samples {
        observe(&mut shapes, "", doc, 1);
    }

    let mut columns: Vec<ColumnMeta> = shapes
        .into_iter()
        .map(|(path, shape)| {
            let data_type = if shape.types.is_empty() {
                "null".to_string()
            } else {
                shape.types.into_iter().collect::<Vec<_>>().join("|")
            };
            ColumnMeta {
                name: path,
                data_type,
                nullable: shape.saw_null || shape.present < samples.len(),
                default: None,
                confidence: SchemaConfidence::Inferred,
                distinct_estimate: None,
            }
        })
        .collect();

    for field in declared {
        let declared_col = ColumnMeta {
            name: field.path.clone(),
            data_type: field.bson_type.clone(),
            nullable: !field.required,
            default: None,
            confidence: SchemaConfidence::Declared,
            distinct_estimate: None,
        };
        match columns.iter_mut().find(|c| c.name == field.path) {
            Some(col) => *col = declared_col,
            None => columns.push(declared_col),
        }
    }

    columns.sort_by(|a, b| {
        (a.name != "_id")
            .cmp(&(b.name != "_id"))
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut table = TableMeta::new(name, TableKind::Collection);
    if columns.iter().any(|c| c.name == "_id") {
        table.primary_key = vec!["_id".to_string()];
    }
    table.columns = columns;
    table.indexes = indexes;
    table.row_count = row_count.or_else(|| (!samples.is_empty()).then_some(samples.len() as u64));
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infers_union_of_shapes() {
        let samples = vec![
            json!({"_id": "a1", "total": 10, "customer": {"name": "Ann", "address": {"city": "Oslo", "geo": {"lat": 1.0}}}}),
            json!({"_id": "a2", "total": 12.5, "status": null}),
        ];
        let table = infer_collection("orders", &samples, &[], vec![], None);
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["_id", "customer.address.city", "customer.address.geo", "customer.name", "status", "total"]
        );

        let total = table.column("total", false).unwrap();
        assert_eq!(total.data_type, "double|int");
        assert!(!total.nullable);
        assert_eq!(total.confidence, SchemaConfidence::Inferred);

        // depth limit keeps the innermost object whole
        assert_eq!(table.column("customer.address.geo", false).unwrap().data_type, "object");
        assert!(table.column("customer.name", false).unwrap().nullable);
        let status = table.column("status", false).unwrap();
        assert!(status.nullable);
        assert_eq!(status.data_type, "null");

        assert_eq!(table.primary_key, vec!["_id"]);
        assert_eq!(table.row_count, Some(2));
        assert_eq!(table.kind, TableKind::Collection);
    }

    #[test]
    fn test_declared_fields_override_samples() {
        let samples = vec![json!({"_id": 1, "email": "a@b.c"})];
        let declared = vec![
            DeclaredField {
                path: "email".into(),
                bson_type: "string".into(),
                required: true,
            },
            DeclaredField {
                path: "phone".into(),
                bson_type: "string".into(),
                required: false,
            },
        ];
        let table = infer_collection("users", &samples, &declared, vec![], Some(900));
        let email = table.column("email", false).unwrap();
        assert_eq!(email.confidence, SchemaConfidence::Declared);
        assert!(!email.nullable);
        assert!(table.column("phone", false).unwrap().nullable);
        assert_eq!(table.row_count, Some(900));
    }

    #[test]
    fn test_empty_collection() {
        let table = infer_collection("empty", &[], &[], vec![], None);
        assert!(table.columns.is_empty());
        assert!(table.primary_key.is_empty());
        assert_eq!(table.row_count, None);
    }
}
