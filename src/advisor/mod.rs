//! Static and plan-based advice for validated statements.
//!
//! Each [`Detector`] looks at the statement tree, the schema graph and,
//! when one was fetched, the backend's execution plan. Detectors are
//! independent and side-effect free; [`analyze`] merges their findings and
//! ranks them so the same inputs always produce the same list.

mod blocks;
mod detectors;

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::config::AdvisorConfig;
use crate::explain::ExecutionPlan;
use crate::schema::SchemaGraph;
use crate::validate::ValidatedQuery;
use blocks::{collect_blocks, QueryBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RecommendationKind {
    MissingIndex,
    FullScan,
    CartesianJoin,
    RedundantSubquery,
    FilterOrder,
    NPlusOne,
}

impl fmt::Display for RecommendationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecommendationKind::MissingIndex => "missing index",
            RecommendationKind::FullScan => "full scan",
            RecommendationKind::CartesianJoin => "cartesian join",
            RecommendationKind::RedundantSubquery => "redundant subquery",
            RecommendationKind::FilterOrder => "filter order",
            RecommendationKind::NPlusOne => "N+1 subquery",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub severity: Severity,
    /// `table` or `table.column` references, sorted.
    pub targets: Vec<String>,
    pub message: String,
    /// Rewrite or DDL that addresses the finding.
    pub suggestion: Option<String>,
    /// Rows affected, when plan statistics were available.
    pub impact: Option<u64>,
}

/// Everything a detector may look at.
pub(crate) struct AnalysisInput<'a> {
    pub plan: Option<&'a ExecutionPlan>,
    pub schema: &'a SchemaGraph,
    pub config: &'a AdvisorConfig,
    blocks: Vec<QueryBlock<'a>>,
}

impl<'a> AnalysisInput<'a> {
    fn blocks(&self) -> &[QueryBlock<'a>] {
        &self.blocks
    }
}

pub(crate) trait Detector: Send + Sync {
    fn detect(&self, input: &AnalysisInput<'_>) -> Vec<Recommendation>;
}

fn detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(detectors::MissingIndex),
        Box::new(detectors::FullScan),
        Box::new(detectors::CartesianJoin),
        Box::new(detectors::RedundantSubquery),
        Box::new(detectors::FilterOrder),
        Box::new(detectors::NPlusOne),
    ]
}

/// Run every detector and rank the findings: severity, then impact, then
/// kind and targets.
pub(crate) fn analyze(
    validated: &ValidatedQuery,
    plan: Option<&ExecutionPlan>,
    schema: &SchemaGraph,
    config: &AdvisorConfig,
) -> Vec<Recommendation> {
    let input = AnalysisInput {
        plan,
        schema,
        config,
        blocks: collect_blocks(validated.statements(), schema),
    };

    let mut found: Vec<Recommendation> = detectors()
        .iter()
        .flat_map(|d| d.detect(&input))
        .collect();
    rank(&mut found);
    debug!(count = found.len(), with_plan = plan.is_some(), "advice computed");
    found
}

fn rank(found: &mut Vec<Recommendation>) {
    for rec in found.iter_mut() {
        rec.targets.sort();
    }
    found.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.impact.unwrap_or(0).cmp(&a.impact.unwrap_or(0)))
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.targets.cmp(&b.targets))
            .then_with(|| a.message.cmp(&b.message))
    });
    found.dedup_by(|a, b| a.kind == b.kind && a.targets == b.targets);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;
    use crate::dialect::Dialect;
    use crate::explain::parse_postgres_text;
    use crate::testing::{indexed_shop_schema, shop_schema};
    use crate::validate::validate_sql;

    fn advise(sql: &str, schema: &SchemaGraph, plan: Option<&ExecutionPlan>) -> Vec<Recommendation> {
        let validated = validate_sql(sql, schema.dialect(), schema, &ValidatorConfig::default())
            .unwrap();
        analyze(&validated, plan, schema, &AdvisorConfig::default())
    }

    fn kinds(recs: &[Recommendation]) -> Vec<RecommendationKind> {
        recs.iter().map(|r| r.kind).collect()
    }

    const TOTALS: &str = "SELECT c.name, COUNT(o.id) AS total_orders FROM customers c \
         JOIN orders o ON o.customer_id = c.id \
         WHERE o.created_at >= DATE_TRUNC('year', NOW()) GROUP BY c.name";

    #[test]
    fn test_missing_index_on_join_column() {
        let recs = advise(TOTALS, &shop_schema(), None);
        assert_eq!(kinds(&recs), vec![RecommendationKind::MissingIndex]);
        let rec = &recs[0];
        assert_eq!(rec.severity, Severity::Medium);
        assert_eq!(rec.targets, vec!["orders.customer_id"]);
        assert_eq!(
            rec.suggestion.as_deref(),
            Some("CREATE INDEX idx_orders_customer_id ON orders (customer_id);")
        );
        assert_eq!(rec.impact, None);
    }

    #[test]
    fn test_clean_when_indexed() {
        assert!(advise(TOTALS, &indexed_shop_schema(), None).is_empty());
    }

    #[test]
    fn test_small_tables_are_not_flagged() {
        let recs = advise("SELECT id FROM customers WHERE email = 'a@b.c'", &shop_schema(), None);
        assert!(recs.is_empty());
    }

    #[test]
    fn test_cartesian_product() {
        let recs = advise("SELECT * FROM customers, orders", &shop_schema(), None);
        let rec = recs
            .iter()
            .find(|r| r.kind == RecommendationKind::CartesianJoin)
            .unwrap();
        assert_eq!(rec.severity, Severity::High);
        assert_eq!(rec.targets, vec!["customers", "orders"]);
        assert_eq!(
            rec.suggestion.as_deref(),
            Some("add a join condition: customers.id = orders.customer_id")
        );
        assert_eq!(recs[0].kind, RecommendationKind::CartesianJoin);
    }

    #[test]
    fn test_explicit_cross_join_is_intended() {
        let recs = advise("SELECT * FROM customers CROSS JOIN orders", &shop_schema(), None);
        assert!(!kinds(&recs).contains(&RecommendationKind::CartesianJoin));

        // a comma next to it still multiplies rows nobody asked for
        let recs = advise(
            "SELECT c.name FROM customers c CROSS JOIN orders o, orders o2",
            &shop_schema(),
            None,
        );
        assert!(kinds(&recs).contains(&RecommendationKind::CartesianJoin));
    }

    #[test]
    fn test_missing_index_on_sort_column() {
        let recs = advise(
            "SELECT id, amount FROM orders ORDER BY created_at DESC LIMIT 10",
            &shop_schema(),
            None,
        );
        assert_eq!(kinds(&recs), vec![RecommendationKind::MissingIndex]);
        assert_eq!(recs[0].severity, Severity::Low);
        assert_eq!(recs[0].targets, vec!["orders.created_at"]);
        assert_eq!(
            recs[0].suggestion.as_deref(),
            Some("CREATE INDEX idx_orders_created_at ON orders (created_at);")
        );

        // primary key order, a small table and grouped output need nothing
        assert!(advise("SELECT amount FROM orders ORDER BY id", &shop_schema(), None).is_empty());
        assert!(advise("SELECT id FROM customers ORDER BY name", &shop_schema(), None).is_empty());
        assert!(advise(
            "SELECT status, COUNT(*) AS n FROM orders GROUP BY status ORDER BY status",
            &shop_schema(),
            None,
        )
        .is_empty());
    }

    #[test]
    fn test_where_equality_connects_relations() {
        let recs = advise(
            "SELECT c.name FROM customers c, orders o WHERE o.customer_id = c.id",
            &indexed_shop_schema(),
            None,
        );
        assert!(recs.is_empty());
    }

    #[test]
    fn test_full_scan_from_plan() {
        let plan = parse_postgres_text(
            "Seq Scan on orders  (cost=0.00..1200.00 rows=50000 width=40)\n  Filter: (status = 'open'::text)",
        )
        .unwrap();
        let recs = advise(
            "SELECT id FROM orders WHERE status = 'open'",
            &shop_schema(),
            Some(&plan),
        );
        let rec = &recs[0];
        assert_eq!(rec.kind, RecommendationKind::FullScan);
        assert_eq!(rec.severity, Severity::High);
        assert_eq!(rec.targets, vec!["orders"]);
        assert_eq!(rec.impact, Some(50_000));
        assert_eq!(
            rec.suggestion.as_deref(),
            Some("CREATE INDEX idx_orders_status ON orders (status);")
        );
        // the missing-index finding carries the plan's row figure too
        let missing = recs
            .iter()
            .find(|r| r.kind == RecommendationKind::MissingIndex)
            .unwrap();
        assert_eq!(missing.impact, Some(50_000));
    }

    #[test]
    fn test_full_scan_needs_a_selective_predicate() {
        let plan =
            parse_postgres_text("Seq Scan on orders  (cost=0.00..1200.00 rows=50000 width=40)").unwrap();
        let recs = advise("SELECT id FROM orders", &shop_schema(), Some(&plan));
        assert!(recs.is_empty());
    }

    #[test]
    fn test_redundant_in_subquery() {
        let recs = advise(
            "SELECT id FROM orders WHERE customer_id IN (SELECT id FROM customers)",
            &indexed_shop_schema(),
            None,
        );
        assert_eq!(kinds(&recs), vec![RecommendationKind::RedundantSubquery]);
        assert_eq!(recs[0].severity, Severity::Low);
        assert_eq!(recs[0].targets, vec!["customers.id"]);
        assert_eq!(
            recs[0].suggestion.as_deref(),
            Some("JOIN customers ON customers.id = customer_id")
        );

        // filtered subqueries are not equivalent to a plain join
        assert!(advise(
            "SELECT id FROM orders WHERE customer_id IN (SELECT id FROM customers WHERE name = 'x')",
            &indexed_shop_schema(),
            None,
        )
        .is_empty());
    }

    #[test]
    fn test_redundant_derived_table() {
        let recs = advise(
            "SELECT t.name FROM (SELECT * FROM customers) t",
            &shop_schema(),
            None,
        );
        assert_eq!(kinds(&recs), vec![RecommendationKind::RedundantSubquery]);
        assert_eq!(recs[0].suggestion.as_deref(), Some("FROM customers AS t"));
    }

    #[test]
    fn test_filter_order_without_predicate_reordering() {
        let mut tables: Vec<_> = shop_schema().tables().cloned().collect();
        tables[1].row_count = Some(500);
        let schema = SchemaGraph::new(Dialect::Sqlite, tables).unwrap();
        let recs = advise(
            "SELECT amount FROM orders WHERE status = 'open' AND id = 42",
            &schema,
            None,
        );
        assert_eq!(kinds(&recs), vec![RecommendationKind::FilterOrder]);
        assert_eq!(recs[0].targets, vec!["orders.id", "orders.status"]);
        assert!(recs[0].message.contains("id = 42"));

        // written in the selective order already
        assert!(advise(
            "SELECT amount FROM orders WHERE id = 42 AND status = 'open'",
            &schema,
            None,
        )
        .is_empty());
    }

    #[test]
    fn test_filter_order_on_reordering_backend_needs_plan_evidence() {
        let sql = "SELECT amount FROM orders WHERE status = 'open' AND id = 42";
        assert!(!kinds(&advise(sql, &indexed_shop_schema(), None))
            .contains(&RecommendationKind::FilterOrder));

        let plan = parse_postgres_text(
            "Index Scan using orders_pkey on orders  (cost=0.29..8.31 rows=1 width=8)\n  Filter: ((status = 'open'::text) AND (id = 42))",
        )
        .unwrap();
        assert!(kinds(&advise(sql, &indexed_shop_schema(), Some(&plan)))
            .contains(&RecommendationKind::FilterOrder));
    }

    #[test]
    fn test_correlated_scalar_subquery() {
        let recs = advise(
            "SELECT c.name, (SELECT COUNT(*) FROM orders o WHERE o.customer_id = c.id) AS n FROM customers c",
            &indexed_shop_schema(),
            None,
        );
        assert_eq!(kinds(&recs), vec![RecommendationKind::NPlusOne]);
        assert_eq!(recs[0].severity, Severity::Medium);
        assert_eq!(recs[0].targets, vec!["orders"]);
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let schema = shop_schema();
        let plan = parse_postgres_text(
            "Nested Loop  (cost=0.00..99999.00 rows=100000000 width=8)\n  ->  Seq Scan on customers  (cost=0.00..40.00 rows=2000 width=4)\n  ->  Seq Scan on orders  (cost=0.00..900.00 rows=50000 width=4)\n        Filter: (status = 'open'::text)",
        )
        .unwrap();
        let sql = "SELECT * FROM customers, orders WHERE orders.status = 'open' AND orders.customer_id IN (SELECT id FROM customers)";
        let first = advise(sql, &schema, Some(&plan));
        let second = advise(sql, &schema, Some(&plan));
        assert_eq!(first, second);
        assert!(first.len() >= 3);
        for pair in first.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
        }
    }
}
