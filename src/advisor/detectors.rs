use std::collections::{BTreeMap, BTreeSet};

use super::blocks::{shape, subqueries, QueryBlock, Shape};
use super::{AnalysisInput, Detector, Recommendation, RecommendationKind, Severity};
use crate::ast::{compile_expr, Expression, JoinCondition, JoinType, Query, SelectItem, TableRef};
use crate::dialect::Dialect;
use crate::schema::{SchemaGraph, TableMeta};

/// `CREATE INDEX` (or `createIndex`) text for one column.
fn index_ddl(schema: &SchemaGraph, table: &str, column: &str) -> String {
    if schema.dialect() == Dialect::MongoDb {
        return format!("db.{table}.createIndex({{\"{column}\": 1}})");
    }
    let rules = schema.dialect().rules();
    let name = format!("idx_{table}_{column}").replace(['.', ' ', '"'], "_");
    format!(
        "CREATE INDEX {} ON {} ({});",
        rules.quote_ident(&name),
        rules.quote_ident(table),
        rules.quote_ident(column)
    )
}

fn render(schema: &SchemaGraph, expr: &Expression) -> String {
    compile_expr(expr, schema.dialect().rules()).unwrap_or_else(|_| "<expression>".to_string())
}

fn large(meta: &TableMeta, input: &AnalysisInput<'_>) -> bool {
    meta.row_count
        .is_some_and(|rows| rows > input.config.row_count_threshold)
}

/// Columns compared against constants or other columns; both sides of an
/// equi-join count.
fn lookup_columns(block: &QueryBlock<'_>, schema: &SchemaGraph) -> BTreeSet<(String, String)> {
    let mut out = BTreeSet::new();
    for predicate in block.predicates() {
        match shape(predicate) {
            Shape::Equality(col) | Shape::InList(col, _) => {
                out.extend(block.column_target(schema, col));
            }
            Shape::EquiJoin(a, b) => {
                out.extend(block.column_target(schema, a));
                out.extend(block.column_target(schema, b));
            }
            _ => {}
        }
    }
    out
}

/// Equality, `IN` and equi-join columns of large tables that no index
/// starts with. Leading sort keys without an index are reported at low
/// severity.
pub(super) struct MissingIndex;

impl MissingIndex {
    fn finding(
        input: &AnalysisInput<'_>,
        table: &str,
        column: &str,
        severity: Severity,
        usage: &str,
    ) -> Option<Recommendation> {
        let schema = input.schema;
        let meta = schema.table(table)?;
        if !large(meta, input) || meta.has_leading_index(column) {
            return None;
        }
        Some(Recommendation {
            kind: RecommendationKind::MissingIndex,
            severity,
            targets: vec![format!("{table}.{column}")],
            message: format!(
                "{table}.{column} is used {usage} but no index starts with it (~{} rows)",
                meta.row_count.unwrap_or_default()
            ),
            suggestion: Some(index_ddl(schema, table, column)),
            impact: input.plan.and_then(|p| p.relation_rows(table)),
        })
    }
}

impl Detector for MissingIndex {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation> {
        let schema = input.schema;
        let mut lookups = BTreeSet::new();
        let mut sorts = BTreeSet::new();
        for block in input.blocks() {
            lookups.extend(lookup_columns(block, schema));
            sorts.extend(
                block
                    .sort_keys
                    .first()
                    .and_then(|key| block.column_target(schema, key)),
            );
        }

        let mut out: Vec<Recommendation> = lookups
            .iter()
            .filter_map(|(table, column)| {
                Self::finding(input, table, column, Severity::Medium, "for lookups")
            })
            .collect();
        out.extend(
            sorts
                .difference(&lookups)
                .filter_map(|(table, column)| {
                    Self::finding(input, table, column, Severity::Low, "for sorting")
                }),
        );
        out
    }
}

/// Plan nodes that read a whole large table although the statement
/// filters it.
pub(super) struct FullScan;

impl FullScan {
    fn table_for<'s>(input: &'s AnalysisInput<'_>, relation: &str) -> Option<&'s TableMeta> {
        input.schema.find_table(relation, true).or_else(|| {
            input
                .blocks()
                .iter()
                .flat_map(|b| b.relations.iter())
                .find(|r| r.binding.eq_ignore_ascii_case(relation))
                .and_then(|r| r.table.as_deref())
                .and_then(|t| input.schema.table(t))
        })
    }
}

impl Detector for FullScan {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation> {
        let Some(plan) = input.plan else {
            return Vec::new();
        };
        let schema = input.schema;
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();

        for node in plan.full_scans() {
            let Some(meta) = node.relation.as_deref().and_then(|r| Self::table_for(input, r)) else {
                continue;
            };
            let rows = node.rows().max(meta.row_count).unwrap_or_default();
            if rows <= input.config.row_count_threshold || !seen.insert(meta.name.clone()) {
                continue;
            }

            let filtered: Vec<String> = input
                .blocks()
                .iter()
                .flat_map(|block| {
                    block.predicates().into_iter().filter_map(move |p| {
                        let s = shape(p);
                        if !s.is_selective() {
                            return None;
                        }
                        block.column_target(schema, s.column()?)
                    })
                })
                .filter(|(table, _)| *table == meta.name)
                .map(|(_, column)| column)
                .collect();
            if filtered.is_empty() {
                continue;
            }

            let suggestion = match filtered.iter().find(|c| !meta.has_leading_index(c)) {
                Some(column) => index_ddl(schema, &meta.name, column),
                None => format!("ANALYZE {};", schema.dialect().rules().quote_ident(&meta.name)),
            };
            let mut columns = filtered.clone();
            columns.sort();
            columns.dedup();
            out.push(Recommendation {
                kind: RecommendationKind::FullScan,
                severity: Severity::High,
                targets: vec![meta.name.clone()],
                message: format!(
                    "the plan reads all of {} (~{rows} rows) although the query filters on {}",
                    meta.name,
                    columns.join(", ")
                ),
                suggestion: Some(suggestion),
                impact: Some(rows),
            });
        }
        out
    }
}

struct UnionFind(Vec<usize>);

impl UnionFind {
    fn new(n: usize) -> Self {
        Self((0..n).collect())
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.0[root] != root {
            root = self.0[root];
        }
        self.0[i] = root;
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.0[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Relations of one block that no join or WHERE predicate connects.
pub(super) struct CartesianJoin;

impl CartesianJoin {
    fn components(block: &QueryBlock<'_>, schema: &SchemaGraph) -> Vec<Vec<usize>> {
        let n = block.relations.len();
        let mut sets = UnionFind::new(n);

        // table functions are usually meant to multiply rows
        for (idx, rel) in block.relations.iter().enumerate() {
            if matches!(rel.source, TableRef::Function { .. }) {
                sets.union(0, idx);
            }
        }
        // so is a written CROSS JOIN
        for join in block.joins.iter().filter(|j| j.join_type == JoinType::Cross) {
            sets.union(join.relation.saturating_sub(1), join.relation);
        }

        let referenced = |expr: &Expression| -> BTreeSet<usize> {
            let mut out = BTreeSet::new();
            expr.walk(&mut |e| {
                if let Expression::Column { table, name } = e {
                    out.extend(block.resolve(schema, table.as_deref(), name));
                }
            });
            out
        };

        for join in &block.joins {
            match join.condition {
                Some(JoinCondition::On(expr)) => {
                    for conjunct in expr.conjuncts() {
                        let rels: Vec<usize> = referenced(conjunct).into_iter().collect();
                        for pair in rels.windows(2) {
                            sets.union(pair[0], pair[1]);
                        }
                    }
                }
                Some(JoinCondition::Using(columns)) => {
                    let earlier = (0..join.relation).find(|&idx| {
                        columns.iter().any(|c| {
                            block.relations[idx]
                                .table
                                .as_deref()
                                .and_then(|t| schema.table(t))
                                .is_some_and(|m| m.column(c, true).is_some())
                        })
                    });
                    let other = earlier.unwrap_or(join.relation.saturating_sub(1));
                    sets.union(other, join.relation);
                }
                Some(JoinCondition::Natural) => {
                    sets.union(join.relation.saturating_sub(1), join.relation);
                }
                None => {}
            }
        }

        for predicate in &block.filter {
            if let Shape::EquiJoin(a, b) = shape(predicate) {
                let resolve = |e: &Expression| match e {
                    Expression::Column { table, name } => block.resolve(schema, table.as_deref(), name),
                    _ => None,
                };
                if let (Some(x), Some(y)) = (resolve(a), resolve(b)) {
                    sets.union(x, y);
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..n {
            let root = sets.find(idx);
            groups.entry(root).or_default().push(idx);
        }
        groups.into_values().collect()
    }
}

impl Detector for CartesianJoin {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation> {
        let schema = input.schema;
        let mut out = Vec::new();

        for block in input.blocks() {
            if block.relations.len() < 2 {
                continue;
            }
            let groups = Self::components(block, schema);
            if groups.len() < 2 {
                continue;
            }

            let name = |idx: usize| {
                let rel = &block.relations[idx];
                rel.table.clone().unwrap_or_else(|| rel.binding.clone())
            };
            let targets: Vec<String> = (0..block.relations.len()).map(name).collect();

            let suggestion = groups[0].iter().find_map(|&a| {
                groups[1..].iter().flatten().find_map(|&b| {
                    let (ta, tb) = (block.relations[a].table.as_deref()?, block.relations[b].table.as_deref()?);
                    let (ca, cb) = schema.join_key(ta, tb)?;
                    Some(format!(
                        "add a join condition: {}.{ca} = {}.{cb}",
                        block.relations[a].binding, block.relations[b].binding
                    ))
                })
            });

            let impact = input.plan.and_then(|plan| {
                targets
                    .iter()
                    .map(|t| plan.relation_rows(t))
                    .try_fold(1u64, |acc, rows| rows.map(|r| acc.saturating_mul(r.max(1))))
            });

            let parts: Vec<String> = groups
                .iter()
                .map(|g| g.iter().map(|&i| block.relations[i].binding.clone()).collect::<Vec<_>>().join(" + "))
                .collect();
            out.push(Recommendation {
                kind: RecommendationKind::CartesianJoin,
                severity: Severity::High,
                targets,
                message: format!(
                    "{} are combined without a join condition, producing every row pairing",
                    parts.join(", ")
                ),
                suggestion: Some(suggestion.unwrap_or_else(|| {
                    "add a join condition, or write CROSS JOIN if every pairing is intended"
                        .to_string()
                })),
                impact,
            });
        }
        out
    }
}

/// Subqueries that are a plain join or a plain table in disguise.
pub(super) struct RedundantSubquery;

impl RedundantSubquery {
    /// `SELECT col FROM table` with nothing else.
    fn bare_lookup(query: &Query) -> Option<(&str, &str)> {
        let Query::Select(select) = query else {
            return None;
        };
        let plain = !select.distinct
            && select.joins.is_empty()
            && select.filter.is_none()
            && select.group_by.is_empty()
            && select.having.is_none()
            && select.limit.is_none()
            && select.offset.is_none()
            && select.set_op.is_none();
        let ([TableRef::Table { name: table, .. }], [SelectItem::Expression { expr, .. }]) =
            (select.from.as_slice(), select.projections.as_slice())
        else {
            return None;
        };
        match expr.unnested() {
            Expression::Column { name, .. } if plain => Some((table.as_str(), name.as_str())),
            _ => None,
        }
    }

    /// `(SELECT * FROM table)`
    fn wrapped_table(query: &Query) -> Option<&str> {
        let Query::Select(select) = query else {
            return None;
        };
        let plain = !select.distinct
            && select.joins.is_empty()
            && select.filter.is_none()
            && select.group_by.is_empty()
            && select.having.is_none()
            && select.order_by.is_empty()
            && select.limit.is_none()
            && select.offset.is_none()
            && select.set_op.is_none();
        match (select.from.as_slice(), select.projections.as_slice()) {
            ([TableRef::Table { name, .. }], [SelectItem::Wildcard]) if plain => Some(name.as_str()),
            _ => None,
        }
    }
}

impl Detector for RedundantSubquery {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation> {
        let schema = input.schema;
        let mut out = Vec::new();

        for block in input.blocks() {
            for expr in &block.expressions {
                expr.walk(&mut |e| {
                    let Expression::InSubquery {
                        expr: outer,
                        subquery,
                        negated: false,
                    } = e
                    else {
                        return;
                    };
                    let Some((table, column)) = Self::bare_lookup(subquery) else {
                        return;
                    };
                    let Some(meta) = schema.find_table(table, true) else {
                        return;
                    };
                    if !meta.is_unique_column(column) {
                        return;
                    }
                    out.push(Recommendation {
                        kind: RecommendationKind::RedundantSubquery,
                        severity: Severity::Low,
                        targets: vec![format!("{}.{column}", meta.name)],
                        message: format!(
                            "IN (SELECT {column} FROM {}) matches at most one row per value and can be a join",
                            meta.name
                        ),
                        suggestion: Some(format!(
                            "JOIN {0} ON {0}.{column} = {1}",
                            meta.name,
                            render(schema, outer)
                        )),
                        impact: None,
                    });
                });
            }

            for rel in &block.relations {
                let TableRef::Subquery { query, alias } = rel.source else {
                    continue;
                };
                let Some(table) = Self::wrapped_table(query) else {
                    continue;
                };
                let name = schema
                    .find_table(table, true)
                    .map_or_else(|| table.to_string(), |m| m.name.clone());
                out.push(Recommendation {
                    kind: RecommendationKind::RedundantSubquery,
                    severity: Severity::Low,
                    targets: vec![name.clone()],
                    message: format!("derived table {alias} only re-selects every column of {name}"),
                    suggestion: Some(format!("FROM {name} AS {alias}")),
                    impact: None,
                });
            }
        }
        out
    }
}

/// A selective predicate written after a much less selective one, on a
/// backend that evaluates filters in written order.
pub(super) struct FilterOrder;

impl FilterOrder {
    fn selectivity(block: &QueryBlock<'_>, schema: &SchemaGraph, predicate: &Expression) -> Option<f64> {
        let equality = |col: &Expression| -> f64 {
            let Some((table, column)) = block.column_target(schema, col) else {
                return 0.1;
            };
            let Some(meta) = schema.table(&table) else {
                return 0.1;
            };
            if meta.is_unique_column(&column) {
                return 1.0 / meta.row_count.unwrap_or(1).max(1) as f64;
            }
            match meta.column(&column, false).and_then(|c| c.distinct_estimate) {
                Some(distinct) if distinct >= 1.0 => 1.0 / distinct,
                _ => 0.1,
            }
        };
        Some(match shape(predicate) {
            Shape::Equality(col) => equality(col),
            Shape::InList(col, n) => (equality(col) * n as f64).min(1.0),
            Shape::Range(_) => 0.33,
            Shape::Like { prefix: true, .. } => 0.1,
            Shape::Like { prefix: false, .. } => 0.5,
            Shape::IsNull { negated: false, .. } => 0.1,
            Shape::IsNull { negated: true, .. } | Shape::NotEqual(_) => 0.9,
            Shape::EquiJoin(..) => return None,
            Shape::Other => 0.5,
        })
    }

    /// Position of `word` in `line` on identifier boundaries.
    fn word_position(line: &str, word: &str) -> Option<usize> {
        let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
        line.match_indices(word).map(|(pos, _)| pos).find(|&pos| {
            let before = line[..pos].chars().next_back();
            let after = line[pos + word.len()..].chars().next();
            !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
        })
    }

    /// The plan's filter evaluates `first` before `second`.
    fn plan_keeps_order(input: &AnalysisInput<'_>, first: &str, second: &str) -> bool {
        input.plan.is_some_and(|plan| {
            plan.filter_lines().iter().any(|line| {
                match (Self::word_position(line, first), Self::word_position(line, second)) {
                    (Some(a), Some(b)) => a < b,
                    _ => false,
                }
            })
        })
    }
}

impl Detector for FilterOrder {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation> {
        let schema = input.schema;
        let reorders = schema.dialect().rules().reorders_predicates;
        let mut out = Vec::new();

        for block in input.blocks() {
            let scored: Vec<(&Expression, f64)> = block
                .filter
                .iter()
                .filter_map(|p| Some((*p, Self::selectivity(block, schema, p)?)))
                .collect();

            let finding = scored.iter().enumerate().skip(1).find_map(|(j, &(late, late_sel))| {
                scored[..j].iter().find_map(|&(early, early_sel)| {
                    (late_sel > 0.0 && early_sel / late_sel >= input.config.filter_order_ratio)
                        .then_some((early, late))
                })
            });
            let Some((early, late)) = finding else {
                continue;
            };

            let column = |e: &Expression| {
                shape(e)
                    .column()
                    .and_then(|c| block.column_target(schema, c))
            };
            let (Some(early_col), Some(late_col)) = (column(early), column(late)) else {
                continue;
            };
            if reorders && !Self::plan_keeps_order(input, &early_col.1, &late_col.1) {
                continue;
            }

            let (early_sql, late_sql) = (render(schema, early), render(schema, late));
            out.push(Recommendation {
                kind: RecommendationKind::FilterOrder,
                severity: Severity::Low,
                targets: vec![
                    format!("{}.{}", early_col.0, early_col.1),
                    format!("{}.{}", late_col.0, late_col.1),
                ],
                message: format!(
                    "`{late_sql}` is far more selective than `{early_sql}` but is evaluated after it"
                ),
                suggestion: Some(format!("move `{late_sql}` to the front of the WHERE clause")),
                impact: None,
            });
        }
        out
    }
}

/// Scalar subqueries in the select list that refer to the outer row and so
/// run once per row.
pub(super) struct NPlusOne;

impl NPlusOne {
    /// Qualified column references in `query`'s own level that name one of
    /// `outer` and none of its own relations.
    fn correlated(query: &Query, outer: &[&str]) -> bool {
        let Query::Select(select) = query else {
            return false;
        };
        let inner: Vec<&str> = select
            .from
            .iter()
            .chain(select.joins.iter().map(|j| &j.table))
            .filter_map(TableRef::binding_name)
            .collect();

        let mut exprs: Vec<&Expression> = select
            .projections
            .iter()
            .filter_map(|item| match item {
                SelectItem::Expression { expr, .. } => Some(expr),
                _ => None,
            })
            .collect();
        exprs.extend(select.filter.as_ref());
        exprs.extend(select.having.as_ref());
        exprs.extend(select.joins.iter().filter_map(|j| match &j.condition {
            Some(JoinCondition::On(e)) => Some(e),
            _ => None,
        }));

        let mut found = false;
        for expr in &exprs {
            expr.walk(&mut |e| {
                if let Expression::Column { table: Some(q), .. } = e {
                    let local = inner.iter().any(|b| b.eq_ignore_ascii_case(q));
                    if !local && outer.iter().any(|b| b.eq_ignore_ascii_case(q)) {
                        found = true;
                    }
                }
            });
        }
        found || subqueries(&exprs).into_iter().any(|q| Self::correlated(q, outer))
    }
}

impl Detector for NPlusOne {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation> {
        let schema = input.schema;
        let mut out = Vec::new();

        for block in input.blocks() {
            let outer: Vec<&str> = block.bindings().collect();
            let outer_tables: Vec<String> = block.relations.iter().filter_map(|r| r.table.clone()).collect();

            for projection in &block.projections {
                projection.walk(&mut |e| {
                    let Expression::Subquery(query) = e else {
                        return;
                    };
                    if !Self::correlated(query, &outer) {
                        return;
                    }
                    let inner_tables: Vec<String> = match &**query {
                        Query::Select(select) => select
                            .from
                            .iter()
                            .chain(select.joins.iter().map(|j| &j.table))
                            .filter_map(TableRef::table_name)
                            .map(|t| schema.find_table(t, true).map_or_else(|| t.to_string(), |m| m.name.clone()))
                            .collect(),
                        _ => Vec::new(),
                    };
                    let impact = input.plan.and_then(|plan| {
                        outer_tables.iter().filter_map(|t| plan.relation_rows(t)).max()
                    });
                    out.push(Recommendation {
                        kind: RecommendationKind::NPlusOne,
                        severity: Severity::Medium,
                        targets: inner_tables.clone(),
                        message: format!(
                            "correlated subquery on {} in the select list runs once per row of {}",
                            inner_tables.join(", "),
                            outer.join(", ")
                        ),
                        suggestion: Some(
                            "aggregate the subquery once with GROUP BY and LEFT JOIN the result"
                                .to_string(),
                        ),
                        impact,
                    });
                });
            }
        }
        out
    }
}
