//! Statement trees flattened into query blocks.
//!
//! A block is one SELECT level (or the target of an UPDATE/DELETE): the
//! relations it reads, its join edges and the expressions that refer to
//! them. Subqueries, CTE bodies and set-operation arms each get their own
//! block.

use crate::ast::{
    BinaryOperator, Expression, JoinCondition, JoinType, Literal, Query, SelectItem, SelectQuery,
    TableRef,
};
use crate::schema::SchemaGraph;

pub(super) struct Relation<'q> {
    pub binding: String,
    /// Catalog table, when the relation is one.
    pub table: Option<String>,
    pub source: &'q TableRef,
}

pub(super) struct JoinEdge<'q> {
    /// Index of the joined relation in [`QueryBlock::relations`].
    pub relation: usize,
    pub join_type: JoinType,
    pub condition: Option<&'q JoinCondition>,
}

#[derive(Default)]
pub(super) struct QueryBlock<'q> {
    pub relations: Vec<Relation<'q>>,
    pub joins: Vec<JoinEdge<'q>>,
    /// WHERE conjuncts in written order.
    pub filter: Vec<&'q Expression>,
    /// Select-list expressions.
    pub projections: Vec<&'q Expression>,
    /// ORDER BY keys of an ungrouped level, in written order.
    pub sort_keys: Vec<&'q Expression>,
    /// Every expression of this level: projections, ON, WHERE, GROUP BY,
    /// HAVING and ORDER BY.
    pub expressions: Vec<&'q Expression>,
}

impl<'q> QueryBlock<'q> {
    /// ON conjuncts of every join, in join order.
    pub fn join_predicates(&self) -> Vec<&'q Expression> {
        self.joins
            .iter()
            .filter_map(|j| match j.condition {
                Some(JoinCondition::On(expr)) => Some(expr.conjuncts()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// WHERE and ON predicates together.
    pub fn predicates(&self) -> Vec<&'q Expression> {
        let mut out = self.filter.clone();
        out.extend(self.join_predicates());
        out
    }

    pub fn bindings(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|r| r.binding.as_str())
    }

    /// Relation a column reference belongs to. Unqualified names resolve
    /// to the only catalog table that has the column.
    pub fn resolve(&self, schema: &SchemaGraph, qualifier: Option<&str>, name: &str) -> Option<usize> {
        match qualifier {
            Some(q) => self
                .relations
                .iter()
                .position(|r| r.binding.eq_ignore_ascii_case(q)),
            None => {
                let hits: Vec<usize> = self
                    .relations
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| {
                        r.table
                            .as_deref()
                            .and_then(|t| schema.table(t))
                            .is_some_and(|meta| meta.column(name, true).is_some())
                    })
                    .map(|(idx, _)| idx)
                    .collect();
                match (hits.as_slice(), self.relations.len()) {
                    ([only], _) => Some(*only),
                    ([], 1) => Some(0),
                    _ => None,
                }
            }
        }
    }

    /// `(table, column)` in catalog spelling for a column expression.
    pub fn column_target(&self, schema: &SchemaGraph, expr: &Expression) -> Option<(String, String)> {
        let Expression::Column { table, name } = expr.unnested() else {
            return None;
        };
        let (idx, column) = match self.resolve(schema, table.as_deref(), name) {
            Some(idx) => (idx, name.clone()),
            // `customer.name` on a single collection is a nested field path
            None => match table {
                Some(path) if self.relations.len() == 1 => (0, format!("{path}.{name}")),
                _ => return None,
            },
        };
        let meta = schema.table(self.relations[idx].table.as_deref()?)?;
        let col = meta.column(&column, true)?;
        Some((meta.name.clone(), col.name.clone()))
    }
}

/// Flatten `statements` into blocks, outermost first.
pub(super) fn collect_blocks<'q>(statements: &'q [Query], schema: &SchemaGraph) -> Vec<QueryBlock<'q>> {
    let mut collector = Collector {
        schema,
        blocks: Vec::new(),
    };
    for statement in statements {
        collector.query(statement, &[]);
    }
    collector.blocks
}

struct Collector<'q, 's> {
    schema: &'s SchemaGraph,
    blocks: Vec<QueryBlock<'q>>,
}

impl<'q> Collector<'q, '_> {
    fn query(&mut self, query: &'q Query, ctes: &[String]) {
        match query {
            Query::Select(select) => self.select(select, ctes),
            Query::With(with) => {
                let mut names = ctes.to_vec();
                for cte in &with.ctes {
                    names.push(cte.name.clone());
                    self.query(&cte.query, &names);
                }
                self.query(&with.body, &names);
            }
            Query::Insert(insert) => {
                if let crate::ast::InsertSource::Query(source) = &insert.source {
                    self.query(source, ctes);
                }
            }
            Query::Update(update) => {
                let mut exprs: Vec<&'q Expression> =
                    update.assignments.iter().map(|a| &a.value).collect();
                exprs.extend(update.filter.as_ref());
                self.dml(&update.table, update.filter.as_ref(), exprs, ctes);
            }
            Query::Delete(delete) => {
                let exprs = delete.filter.iter().collect();
                self.dml(&delete.table, delete.filter.as_ref(), exprs, ctes);
            }
            Query::Ddl(_) | Query::Raw(_) => {}
        }
    }

    fn select(&mut self, select: &'q SelectQuery, ctes: &[String]) {
        let mut block = QueryBlock::default();
        let mut derived: Vec<&'q Query> = Vec::new();

        for table in &select.from {
            self.relation(&mut block, table, ctes, &mut derived);
        }
        for join in &select.joins {
            let relation = block.relations.len();
            self.relation(&mut block, &join.table, ctes, &mut derived);
            block.joins.push(JoinEdge {
                relation,
                join_type: join.join_type,
                condition: join.condition.as_ref(),
            });
            if let Some(JoinCondition::On(expr)) = &join.condition {
                block.expressions.push(expr);
            }
        }
        for item in &select.projections {
            if let SelectItem::Expression { expr, .. } = item {
                block.projections.push(expr);
                block.expressions.push(expr);
            }
        }
        if let Some(filter) = &select.filter {
            block.filter = filter.conjuncts();
            block.expressions.push(filter);
        }
        block.expressions.extend(select.group_by.iter());
        block.expressions.extend(select.having.as_ref());
        block.expressions.extend(select.order_by.iter().map(|o| &o.expr));
        if select.group_by.is_empty() {
            block.sort_keys = select.order_by.iter().map(|o| &o.expr).collect();
        }

        let nested = subqueries(&block.expressions);
        self.blocks.push(block);
        for query in derived.into_iter().chain(nested) {
            self.query(query, ctes);
        }
        if let Some(set_op) = &select.set_op {
            self.query(&set_op.right, ctes);
        }
    }

    fn dml(
        &mut self,
        target: &'q TableRef,
        filter: Option<&'q Expression>,
        expressions: Vec<&'q Expression>,
        ctes: &[String],
    ) {
        let mut block = QueryBlock::default();
        let mut derived = Vec::new();
        self.relation(&mut block, target, ctes, &mut derived);
        block.filter = filter.map(Expression::conjuncts).unwrap_or_default();
        block.expressions = expressions;
        let nested = subqueries(&block.expressions);
        self.blocks.push(block);
        for query in derived.into_iter().chain(nested) {
            self.query(query, ctes);
        }
    }

    fn relation(
        &self,
        block: &mut QueryBlock<'q>,
        source: &'q TableRef,
        ctes: &[String],
        derived: &mut Vec<&'q Query>,
    ) {
        let table = match source {
            TableRef::Table { name, .. } if !ctes.iter().any(|c| c.eq_ignore_ascii_case(name)) => {
                self.schema.find_table(name, true).map(|t| t.name.clone())
            }
            TableRef::Subquery { query, .. } => {
                derived.push(query);
                None
            }
            TableRef::Function { args, .. } => {
                block.expressions.extend(args.iter());
                None
            }
            _ => None,
        };
        block.relations.push(Relation {
            binding: source.binding_name().unwrap_or_default().to_string(),
            table,
            source,
        });
    }
}

/// Subqueries embedded anywhere in `exprs`, not descending into them.
pub(super) fn subqueries<'q>(exprs: &[&'q Expression]) -> Vec<&'q Query> {
    let mut out = Vec::new();
    for expr in exprs {
        expr.walk(&mut |e| {
            if let Some(query) = e.subquery() {
                out.push(query);
            }
        });
    }
    out
}

/// Predicate forms the detectors reason about.
#[derive(Debug, Clone, Copy)]
pub(super) enum Shape<'e> {
    /// `col = constant`
    Equality(&'e Expression),
    /// `col IN (c1, c2, ...)`
    InList(&'e Expression, usize),
    /// `col_a = col_b`
    EquiJoin(&'e Expression, &'e Expression),
    /// `col < constant`, `col BETWEEN a AND b`, ...
    Range(&'e Expression),
    Like { column: &'e Expression, prefix: bool },
    IsNull { column: &'e Expression, negated: bool },
    NotEqual(&'e Expression),
    Other,
}

impl Shape<'_> {
    /// Narrows the rows a scan must return.
    pub fn is_selective(&self) -> bool {
        matches!(
            self,
            Shape::Equality(_) | Shape::InList(..) | Shape::Range(_) | Shape::Like { prefix: true, .. }
        )
    }

    pub fn column(&self) -> Option<&Expression> {
        match *self {
            Shape::Equality(c)
            | Shape::InList(c, _)
            | Shape::Range(c)
            | Shape::NotEqual(c)
            | Shape::Like { column: c, .. }
            | Shape::IsNull { column: c, .. } => Some(c),
            Shape::EquiJoin(..) | Shape::Other => None,
        }
    }
}

fn is_column(expr: &Expression) -> bool {
    matches!(expr.unnested(), Expression::Column { .. })
}

/// No column references and no subqueries.
fn is_constant(expr: &Expression) -> bool {
    let mut constant = true;
    expr.walk(&mut |e| {
        if matches!(
            e,
            Expression::Column { .. }
                | Expression::Subquery(_)
                | Expression::Exists(_)
                | Expression::InSubquery { .. }
                | Expression::Opaque(_)
        ) {
            constant = false;
        }
    });
    constant
}

pub(super) fn shape(expr: &Expression) -> Shape<'_> {
    match expr.unnested() {
        Expression::BinaryOp { left, op, right } => {
            let (l, r) = (left.unnested(), right.unnested());
            let column_vs_constant = if is_column(l) && is_constant(r) {
                Some(l)
            } else if is_column(r) && is_constant(l) {
                Some(r)
            } else {
                None
            };
            match op {
                BinaryOperator::Eq if is_column(l) && is_column(r) => Shape::EquiJoin(l, r),
                BinaryOperator::Eq => column_vs_constant.map_or(Shape::Other, Shape::Equality),
                BinaryOperator::NotEq => column_vs_constant.map_or(Shape::Other, Shape::NotEqual),
                op if op.is_range() => column_vs_constant.map_or(Shape::Other, Shape::Range),
                BinaryOperator::Like | BinaryOperator::ILike if is_column(l) => match r {
                    Expression::Literal(Literal::String(pattern)) => Shape::Like {
                        column: l,
                        prefix: !pattern.starts_with(['%', '_']),
                    },
                    _ => Shape::Other,
                },
                _ => Shape::Other,
            }
        }
        Expression::InList {
            expr,
            list,
            negated: false,
        } if is_column(expr) && list.iter().all(is_constant) => {
            Shape::InList(expr.unnested(), list.len())
        }
        Expression::Between {
            expr,
            low,
            high,
            negated: false,
        } if is_column(expr) && is_constant(low) && is_constant(high) => {
            Shape::Range(expr.unnested())
        }
        Expression::IsNull { expr, negated } if is_column(expr) => Shape::IsNull {
            column: expr.unnested(),
            negated: *negated,
        },
        _ => Shape::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_single;
    use crate::testing::shop_schema;

    fn parse(sql: &str) -> Query {
        parse_single(sql).unwrap()
    }

    #[test]
    fn test_blocks_for_nested_queries() {
        let query = parse(
            "WITH recent AS (SELECT * FROM orders WHERE amount > 10) \
             SELECT c.name FROM customers c JOIN recent r ON r.customer_id = c.id \
             WHERE c.id IN (SELECT customer_id FROM orders) \
             UNION SELECT name FROM customers",
        );
        let schema = shop_schema();
        let blocks = collect_blocks(std::slice::from_ref(&query), &schema);
        assert_eq!(blocks.len(), 4);

        // CTE body first, then the main body and its IN subquery, then the union arm
        assert_eq!(blocks[0].relations[0].table.as_deref(), Some("orders"));
        let main = &blocks[1];
        assert_eq!(main.bindings().collect::<Vec<_>>(), vec!["c", "r"]);
        assert_eq!(main.relations[1].table, None);
        assert_eq!(main.join_predicates().len(), 1);
        assert_eq!(main.filter.len(), 1);
        assert_eq!(blocks[2].relations[0].binding, "orders");
        assert_eq!(blocks[3].relations[0].binding, "customers");
    }

    #[test]
    fn test_column_resolution() {
        let query = parse("SELECT name FROM customers c JOIN orders o ON o.customer_id = c.id");
        let schema = shop_schema();
        let blocks = collect_blocks(std::slice::from_ref(&query), &schema);
        let block = &blocks[0];

        let target = |expr: &Expression| block.column_target(&schema, expr);
        assert_eq!(
            target(&Expression::column(Some("o"), "customer_id")),
            Some(("orders".to_string(), "customer_id".to_string()))
        );
        assert_eq!(
            target(&Expression::column(None, "name")),
            Some(("customers".to_string(), "name".to_string()))
        );
        // `id` exists on both sides
        assert_eq!(target(&Expression::column(None, "id")), None);
        assert_eq!(target(&Expression::column(Some("x"), "id")), None);
    }

    #[test]
    fn test_predicate_shapes() {
        let query = parse(
            "SELECT id FROM orders WHERE status = 'open' AND id IN (1, 2, 3) \
             AND customer_id = id AND amount BETWEEN 1 AND 5 AND status LIKE 'op%' \
             AND status LIKE '%en' AND created_at IS NULL AND status <> 'x' \
             AND created_at >= NOW() AND amount + 1 = 3",
        );
        let Query::Select(select) = &query else {
            panic!("expected select");
        };
        let conjuncts = select.filter.as_ref().unwrap().conjuncts();
        let shapes: Vec<Shape> = conjuncts.into_iter().map(shape).collect();
        assert!(matches!(shapes[0], Shape::Equality(_)));
        assert!(matches!(shapes[1], Shape::InList(_, 3)));
        assert!(matches!(shapes[2], Shape::EquiJoin(..)));
        assert!(matches!(shapes[3], Shape::Range(_)));
        assert!(matches!(shapes[4], Shape::Like { prefix: true, .. }));
        assert!(matches!(shapes[5], Shape::Like { prefix: false, .. }));
        assert!(matches!(shapes[6], Shape::IsNull { negated: false, .. }));
        assert!(matches!(shapes[7], Shape::NotEqual(_)));
        assert!(matches!(shapes[8], Shape::Range(_)));
        assert!(matches!(shapes[9], Shape::Other));
        assert!(shapes[0].is_selective());
        assert!(!shapes[5].is_selective());
    }
}
