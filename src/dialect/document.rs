//! Lowering of the SQL subset a document store can answer into MongoDB
//! `find` specs and aggregation pipelines.

use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use crate::ast::types::*;
use crate::dialect::Dialect;
use crate::error::{PipelineError, PipelineResult};

/// A MongoDB query, ready for a driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DocumentQuerySpec {
    Find {
        collection: String,
        filter: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        projection: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sort: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skip: Option<u64>,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<Value>,
    },
}

impl DocumentQuerySpec {
    pub fn collection(&self) -> &str {
        match self {
            DocumentQuerySpec::Find { collection, .. }
            | DocumentQuerySpec::Aggregate { collection, .. } => collection,
        }
    }
}

fn unsupported<T>(construct: impl Into<String>) -> PipelineResult<T> {
    Err(PipelineError::unsupported(construct, Dialect::MongoDb))
}

pub(crate) fn to_document_query(query: &Query) -> PipelineResult<DocumentQuerySpec> {
    let select = match query {
        Query::Select(select) => select,
        Query::With(_) => return unsupported("WITH"),
        Query::Insert(_) | Query::Update(_) | Query::Delete(_) => {
            return unsupported("data modification")
        }
        Query::Ddl(_) | Query::Raw(_) => return unsupported("non-query statement"),
    };

    if select.set_op.is_some() {
        return unsupported("set operations");
    }
    if !select.joins.is_empty() || select.from.len() > 1 {
        return unsupported("joins");
    }
    if select.distinct {
        return unsupported("DISTINCT");
    }
    if select.having.is_some() {
        return unsupported("HAVING");
    }

    let (collection, binding) = match select.from.first() {
        Some(TableRef::Table { name, alias, .. }) => {
            (name.clone(), alias.clone().unwrap_or_else(|| name.clone()))
        }
        Some(_) => return unsupported("derived tables"),
        None => return unsupported("SELECT without a collection"),
    };
    let lower = Lowering { binding: &binding };

    let filter = match &select.filter {
        Some(expr) => lower.filter(expr)?,
        None => json!({}),
    };
    let limit = select.limit.as_ref().map(count_literal).transpose()?;
    let skip = select.offset.as_ref().map(count_literal).transpose()?;

    let has_aggregate = select.projections.iter().any(|item| {
        matches!(
            item,
            SelectItem::Expression {
                expr: Expression::Aggregate { .. },
                ..
            }
        )
    });

    if !has_aggregate && select.group_by.is_empty() {
        let projection = lower.projection(&select.projections)?;
        let sort = lower.sort(&select.order_by, None)?;
        return Ok(DocumentQuerySpec::Find {
            collection,
            filter,
            projection,
            sort,
            limit,
            skip,
        });
    }

    let mut pipeline = Vec::new();
    if filter != json!({}) {
        pipeline.push(json!({ "$match": filter }));
    }

    let keys = select
        .group_by
        .iter()
        .map(|expr| lower.field(expr))
        .collect::<PipelineResult<Vec<_>>>()?;
    let group_id = if keys.is_empty() {
        Value::Null
    } else {
        Value::Object(
            keys.iter()
                .map(|k| (output_name(k), json!(format!("${k}"))))
                .collect(),
        )
    };

    let mut group = Map::new();
    group.insert("_id".into(), group_id);
    let mut project = Map::new();
    project.insert("_id".into(), json!(0));
    let mut outputs = Vec::new();

    for item in &select.projections {
        let SelectItem::Expression { expr, alias } = item else {
            return unsupported("wildcard with aggregation");
        };
        match expr {
            Expression::Aggregate {
                name,
                args,
                distinct,
            } => {
                if *distinct {
                    return unsupported(format!("{name}(DISTINCT)"));
                }
                let out = alias
                    .clone()
                    .unwrap_or_else(|| aggregate_name(name, args, &lower));
                group.insert(out.clone(), lower.accumulator(name, args)?);
                project.insert(out.clone(), json!(1));
                outputs.push((expr.clone(), out));
            }
            other => {
                let field = lower.field(other)?;
                if !keys.contains(&field) {
                    return unsupported(format!("`{field}` outside GROUP BY"));
                }
                let out = alias.clone().unwrap_or_else(|| output_name(&field));
                project.insert(out.clone(), json!(format!("$_id.{}", output_name(&field))));
                outputs.push((other.clone(), out));
            }
        }
    }

    pipeline.push(json!({ "$group": Value::Object(group) }));
    pipeline.push(json!({ "$project": Value::Object(project) }));
    if let Some(sort) = lower.sort(&select.order_by, Some(&outputs))? {
        pipeline.push(json!({ "$sort": sort }));
    }
    if let Some(skip) = skip {
        pipeline.push(json!({ "$skip": skip }));
    }
    if let Some(limit) = limit {
        pipeline.push(json!({ "$limit": limit }));
    }

    Ok(DocumentQuerySpec::Aggregate {
        collection,
        pipeline,
    })
}

struct Lowering<'a> {
    binding: &'a str,
}

impl Lowering<'_> {
    /// Field path of a column reference; other qualifiers are nested paths.
    fn field(&self, expr: &Expression) -> PipelineResult<String> {
        match expr.unnested() {
            Expression::Column { table: None, name } => Ok(name.clone()),
            Expression::Column {
                table: Some(t),
                name,
            } if t.eq_ignore_ascii_case(self.binding) => Ok(name.clone()),
            Expression::Column {
                table: Some(t),
                name,
            } => Ok(format!("{t}.{name}")),
            _ => unsupported("computed expressions"),
        }
    }

    fn filter(&self, expr: &Expression) -> PipelineResult<Value> {
        match expr.unnested() {
            Expression::BinaryOp {
                left,
                op: op @ (BinaryOperator::And | BinaryOperator::Or),
                right,
            } => {
                let key = if *op == BinaryOperator::And {
                    "$and"
                } else {
                    "$or"
                };
                let mut parts = Vec::new();
                self.flatten(left, *op, &mut parts)?;
                self.flatten(right, *op, &mut parts)?;
                Ok(json!({ key: parts }))
            }
            Expression::BinaryOp { left, op, right } if op.is_comparison() => {
                let (field, value, op) = match (self.field(left), literal(right)) {
                    (Ok(field), Ok(value)) => (field, value, *op),
                    _ => (self.field(right)?, literal(left)?, flip(*op)),
                };
                Ok(match op {
                    BinaryOperator::Eq => json!({ field: value }),
                    other => json!({ field: { comparison_operator(other): value } }),
                })
            }
            Expression::BinaryOp {
                left,
                op: BinaryOperator::Like,
                right,
            } => {
                let field = self.field(left)?;
                let Expression::Literal(Literal::String(pattern)) = right.unnested() else {
                    return unsupported("LIKE with a non-literal pattern");
                };
                let prefix = match pattern.strip_suffix('%') {
                    Some(p) if !p.contains(['%', '_']) => p,
                    _ => return unsupported("LIKE other than a prefix match"),
                };
                Ok(json!({ field: { "$regex": format!("^{}", escape_regex(prefix)) } }))
            }
            Expression::InList {
                expr,
                list,
                negated,
            } => {
                let field = self.field(expr)?;
                let values = list.iter().map(literal).collect::<PipelineResult<Vec<_>>>()?;
                let key = if *negated { "$nin" } else { "$in" };
                Ok(json!({ field: { key: values } }))
            }
            Expression::Between {
                expr,
                low,
                high,
                negated: false,
            } => {
                let field = self.field(expr)?;
                Ok(json!({ field: { "$gte": literal(low)?, "$lte": literal(high)? } }))
            }
            Expression::IsNull { expr, negated } => {
                let field = self.field(expr)?;
                Ok(if *negated {
                    json!({ field: { "$ne": null } })
                } else {
                    json!({ field: null })
                })
            }
            Expression::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => Ok(json!({ "$nor": [self.filter(expr)?] })),
            other => unsupported(format!("filter `{}`", short_kind(other))),
        }
    }

    fn flatten(
        &self,
        expr: &Expression,
        op: BinaryOperator,
        out: &mut Vec<Value>,
    ) -> PipelineResult<()> {
        match expr.unnested() {
            Expression::BinaryOp {
                left,
                op: inner,
                right,
            } if *inner == op => {
                self.flatten(left, op, out)?;
                self.flatten(right, op, out)
            }
            other => {
                out.push(self.filter(other)?);
                Ok(())
            }
        }
    }

    fn projection(&self, items: &[SelectItem]) -> PipelineResult<Option<Value>> {
        let mut projection = Map::new();
        for item in items {
            match item {
                SelectItem::Wildcard => return Ok(None),
                SelectItem::QualifiedWildcard(t) if t.eq_ignore_ascii_case(self.binding) => {
                    return Ok(None)
                }
                SelectItem::Expression { expr, alias: None } => {
                    projection.insert(self.field(expr)?, json!(1));
                }
                SelectItem::Expression { alias: Some(_), .. } => {
                    return unsupported("column aliases without aggregation")
                }
                SelectItem::QualifiedWildcard(t) => return unsupported(format!("{t}.*")),
            }
        }
        Ok(Some(Value::Object(projection)))
    }

    fn sort(
        &self,
        order_by: &[OrderByExpr],
        outputs: Option<&[(Expression, String)]>,
    ) -> PipelineResult<Option<Value>> {
        if order_by.is_empty() {
            return Ok(None);
        }
        let mut sort = Map::new();
        for order in order_by {
            if order.nulls_first.is_some() {
                return unsupported("NULLS FIRST/LAST");
            }
            let key = match outputs {
                Some(outputs) => match outputs.iter().find(|(expr, out)| {
                    expr == &order.expr
                        || matches!(&order.expr, Expression::Column { table: None, name } if name == out)
                }) {
                    Some((_, out)) => out.clone(),
                    None => return unsupported("ORDER BY on a value not in the output"),
                },
                None => self.field(&order.expr)?,
            };
            let direction = if order.asc == Some(false) { -1 } else { 1 };
            sort.insert(key, json!(direction));
        }
        Ok(Some(Value::Object(sort)))
    }

    fn accumulator(&self, name: &str, args: &[Expression]) -> PipelineResult<Value> {
        match (name, args) {
            ("COUNT", [Expression::Wildcard]) | ("COUNT", []) => Ok(json!({ "$sum": 1 })),
            ("COUNT", [arg]) => {
                let field = self.field(arg)?;
                Ok(json!({ "$sum": { "$cond": [{ "$ne": [format!("${field}"), null] }, 1, 0] } }))
            }
            ("SUM" | "AVG" | "MIN" | "MAX", [arg]) => {
                let field = self.field(arg)?;
                Ok(json!({ format!("${}", name.to_lowercase()): format!("${field}") }))
            }
            _ => unsupported(format!("aggregate {name}")),
        }
    }
}

fn aggregate_name(name: &str, args: &[Expression], lower: &Lowering<'_>) -> String {
    match args.first().map(|a| lower.field(a)) {
        Some(Ok(field)) => format!("{}_{}", name.to_lowercase(), output_name(&field)),
        _ => name.to_lowercase(),
    }
}

fn output_name(field: &str) -> String {
    field.replace('.', "_")
}

fn literal(expr: &Expression) -> PipelineResult<Value> {
    match expr.unnested() {
        Expression::Literal(Literal::Null) => Ok(Value::Null),
        Expression::Literal(Literal::Boolean(b)) => Ok(json!(b)),
        Expression::Literal(Literal::Integer(i)) => Ok(json!(i)),
        Expression::Literal(Literal::Float(f)) => match Number::from_f64(*f) {
            Some(n) => Ok(Value::Number(n)),
            None => unsupported("non-finite number"),
        },
        Expression::Literal(Literal::String(s)) => Ok(json!(s)),
        Expression::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.unnested() {
            Expression::Literal(Literal::Integer(i)) => Ok(json!(-i)),
            Expression::Literal(Literal::Float(f)) => literal(&Expression::Literal(Literal::Float(-f))),
            _ => unsupported("computed values"),
        },
        _ => unsupported("computed values"),
    }
}

fn count_literal(expr: &Expression) -> PipelineResult<u64> {
    match expr.unnested() {
        Expression::Literal(Literal::Integer(n)) if *n >= 0 => Ok(*n as u64),
        _ => unsupported("non-constant LIMIT/OFFSET"),
    }
}

fn flip(op: BinaryOperator) -> BinaryOperator {
    match op {
        BinaryOperator::Lt => BinaryOperator::Gt,
        BinaryOperator::LtEq => BinaryOperator::GtEq,
        BinaryOperator::Gt => BinaryOperator::Lt,
        BinaryOperator::GtEq => BinaryOperator::LtEq,
        other => other,
    }
}

fn comparison_operator(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::NotEq => "$ne",
        BinaryOperator::Lt => "$lt",
        BinaryOperator::LtEq => "$lte",
        BinaryOperator::Gt => "$gt",
        BinaryOperator::GtEq => "$gte",
        _ => "$eq",
    }
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn short_kind(expr: &Expression) -> &'static str {
    match expr {
        Expression::Subquery(_) | Expression::Exists(_) | Expression::InSubquery { .. } => {
            "subquery"
        }
        Expression::Function { .. } => "function call",
        Expression::Case { .. } => "CASE",
        Expression::BinaryOp { .. } => "operator",
        _ => "expression",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parser::parse_sql_with;

    fn lower(sql: &str) -> PipelineResult<DocumentQuerySpec> {
        let query = parse_sql_with(sql, Dialect::MongoDb).unwrap().remove(0);
        to_document_query(&query)
    }

    #[test]
    fn test_find_with_filter_sort_limit() {
        let spec = lower(
            "SELECT name, email FROM users WHERE age >= 21 AND status = 'active' ORDER BY name DESC LIMIT 10",
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "operation": "find",
                "collection": "users",
                "filter": { "$and": [ { "age": { "$gte": 21 } }, { "status": "active" } ] },
                "projection": { "name": 1, "email": 1 },
                "sort": { "name": -1 },
                "limit": 10
            })
        );
    }

    #[test]
    fn test_literal_on_left_is_flipped() {
        match lower("SELECT * FROM users WHERE 18 < age").unwrap() {
            DocumentQuerySpec::Find { filter, projection, .. } => {
                assert_eq!(filter, json!({ "age": { "$gt": 18 } }));
                assert!(projection.is_none());
            }
            other => panic!("expected find, got {:?}", other),
        }
    }

    #[test]
    fn test_like_prefix_and_in() {
        match lower("SELECT * FROM users WHERE name LIKE 'Jo%' OR country IN ('DE', 'FR')").unwrap() {
            DocumentQuerySpec::Find { filter, .. } => assert_eq!(
                filter,
                json!({ "$or": [
                    { "name": { "$regex": "^Jo" } },
                    { "country": { "$in": ["DE", "FR"] } }
                ] })
            ),
            other => panic!("expected find, got {:?}", other),
        }
    }

    #[test]
    fn test_group_by_becomes_pipeline() {
        let spec = lower(
            "SELECT status, COUNT(*) AS n, SUM(amount) FROM orders WHERE amount > 0 GROUP BY status ORDER BY n DESC",
        )
        .unwrap();
        assert_eq!(
            spec,
            DocumentQuerySpec::Aggregate {
                collection: "orders".into(),
                pipeline: vec![
                    json!({ "$match": { "amount": { "$gt": 0 } } }),
                    json!({ "$group": {
                        "_id": { "status": "$status" },
                        "n": { "$sum": 1 },
                        "sum_amount": { "$sum": "$amount" }
                    } }),
                    json!({ "$project": { "_id": 0, "status": "$_id.status", "n": 1, "sum_amount": 1 } }),
                    json!({ "$sort": { "n": -1 } }),
                ],
            }
        );
    }

    #[test]
    fn test_nested_field_path() {
        match lower("SELECT * FROM users WHERE address.city = 'Berlin'").unwrap() {
            DocumentQuerySpec::Find { filter, .. } => {
                assert_eq!(filter, json!({ "address.city": "Berlin" }))
            }
            other => panic!("expected find, got {:?}", other),
        }
    }

    #[test]
    fn test_join_is_unsupported() {
        let err = lower("SELECT * FROM a JOIN b ON a.id = b.a_id").unwrap_err();
        assert_eq!(err.to_string(), "joins is not supported by MongoDB");
    }

    #[test]
    fn test_infix_like_is_unsupported() {
        assert!(lower("SELECT * FROM users WHERE name LIKE '%x%'").is_err());
    }
}
