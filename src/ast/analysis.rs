/// Structural analysis of a statement tree.
///
/// Collects feature flags and counts in one pass, and derives a 0–10
/// complexity score from them.
use serde::Serialize;

use super::types::*;

/// Analyze a query and return metadata about its structure.
pub fn analyze_query(query: &Query) -> QueryAnalysis {
    let mut analysis = QueryAnalysis::default();
    analyze_query_inner(query, &mut analysis);
    analysis
}

fn analyze_query_inner(query: &Query, analysis: &mut QueryAnalysis) {
    match query {
        Query::Select(s) => {
            analysis.has_select = true;
            if s.distinct {
                analysis.has_distinct = true;
            }
            analysis.join_count += s.joins.len();
            // comma-separated FROM items are joins too
            analysis.join_count += s.from.len().saturating_sub(1);
            if !s.group_by.is_empty() {
                analysis.has_grouping = true;
            }
            if let Some(ref set_op) = s.set_op {
                analysis.has_set_operations = true;
                analyze_query_inner(&set_op.right, analysis);
            }
            for table in s.from.iter().chain(s.joins.iter().map(|j| &j.table)) {
                if let TableRef::Subquery { query, .. } = table {
                    analysis.subquery_count += 1;
                    analyze_query_inner(query, analysis);
                }
            }
            for item in &s.projections {
                if let SelectItem::Expression { expr, .. } = item {
                    check_expr_features(expr, analysis);
                }
            }
            for join in &s.joins {
                if let Some(JoinCondition::On(expr)) = &join.condition {
                    check_expr_features(expr, analysis);
                }
            }
            if let Some(ref filter) = s.filter {
                analysis.filter_predicates += filter.conjuncts().len();
                check_expr_features(filter, analysis);
            }
            if let Some(ref having) = s.having {
                check_expr_features(having, analysis);
            }
        }
        Query::With(cte) => {
            analysis.cte_count += cte.ctes.len();
            if cte.recursive {
                analysis.has_recursive_cte = true;
            }
            for c in &cte.ctes {
                analyze_query_inner(&c.query, analysis);
            }
            analyze_query_inner(&cte.body, analysis);
        }
        Query::Insert(i) => {
            analysis.has_insert = true;
            if let InsertSource::Query(q) = &i.source {
                analyze_query_inner(q, analysis);
            }
        }
        Query::Update(u) => {
            analysis.has_update = true;
            if let Some(ref filter) = u.filter {
                analysis.filter_predicates += filter.conjuncts().len();
                check_expr_features(filter, analysis);
            }
        }
        Query::Delete(d) => {
            analysis.has_delete = true;
            if let Some(ref filter) = d.filter {
                analysis.filter_predicates += filter.conjuncts().len();
                check_expr_features(filter, analysis);
            }
        }
        Query::Ddl(_) | Query::Raw(_) => {}
    }
}

fn check_expr_features(expr: &Expression, analysis: &mut QueryAnalysis) {
    expr.walk(&mut |e| match e {
        Expression::WindowFunction { .. } => analysis.window_function_count += 1,
        Expression::Aggregate { .. } => analysis.aggregate_count += 1,
        Expression::JsonAccess { .. } => analysis.has_json_operations = true,
        _ => {}
    });
    let mut nested = Vec::new();
    expr.walk(&mut |e| {
        if let Some(q) = e.subquery() {
            nested.push(q);
        }
    });
    for q in nested {
        analysis.subquery_count += 1;
        analyze_query_inner(q, analysis);
    }
}

/// Structural metadata about a query.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct QueryAnalysis {
    pub has_select: bool,
    pub has_insert: bool,
    pub has_update: bool,
    pub has_delete: bool,
    pub has_distinct: bool,
    pub join_count: usize,
    pub has_grouping: bool,
    pub aggregate_count: usize,
    pub window_function_count: usize,
    pub subquery_count: usize,
    pub cte_count: usize,
    pub has_recursive_cte: bool,
    pub has_set_operations: bool,
    pub has_json_operations: bool,
    /// AND-ed conjuncts across WHERE clauses.
    pub filter_predicates: usize,
}

/// A 0–10 score with the factors that contributed to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Complexity {
    pub score: u8,
    pub factors: Vec<&'static str>,
}

impl QueryAnalysis {
    pub fn complexity_score(&self) -> Complexity {
        let mut score = 0usize;
        let mut factors = Vec::new();

        if self.subquery_count + self.cte_count > 0 {
            score += 2;
            factors.push("nested subqueries");
        }
        if self.join_count > 1 {
            score += self.join_count.min(3);
            factors.push("multiple joins");
        }
        if self.aggregate_count > 0 {
            score += self.aggregate_count.min(2);
            factors.push("aggregations");
        }
        if self.window_function_count > 0 {
            score += 2;
            factors.push("window functions");
        }
        if self.filter_predicates > 2 {
            score += (self.filter_predicates - 2).min(2);
            factors.push("complex filtering");
        }
        if self.has_distinct {
            score += 1;
            factors.push("DISTINCT");
        }

        Complexity {
            score: score.min(10) as u8,
            factors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parser::parse_single;

    fn analyze(sql: &str) -> QueryAnalysis {
        analyze_query(&parse_single(sql).unwrap())
    }

    #[test]
    fn test_analyze_simple_select() {
        let analysis = analyze("SELECT * FROM users");
        assert!(analysis.has_select);
        assert_eq!(analysis.join_count, 0);
        assert_eq!(analysis.complexity_score().score, 0);
    }

    #[test]
    fn test_analyze_join_query() {
        let analysis = analyze("SELECT * FROM a JOIN b ON a.id = b.a_id LEFT JOIN c ON b.id = c.b_id");
        assert_eq!(analysis.join_count, 2);
    }

    #[test]
    fn test_comma_join_counts() {
        assert_eq!(analyze("SELECT * FROM a, b").join_count, 1);
    }

    #[test]
    fn test_analyze_window_and_aggregate() {
        let analysis =
            analyze("SELECT dept, COUNT(*), ROW_NUMBER() OVER (ORDER BY dept) FROM emp GROUP BY dept");
        assert!(analysis.has_grouping);
        assert_eq!(analysis.aggregate_count, 1);
        assert_eq!(analysis.window_function_count, 1);
    }

    #[test]
    fn test_analyze_recursive_cte() {
        let analysis = analyze(
            "WITH RECURSIVE nums AS (SELECT 1 AS n UNION ALL SELECT n + 1 FROM nums WHERE n < 10) SELECT * FROM nums",
        );
        assert_eq!(analysis.cte_count, 1);
        assert!(analysis.has_recursive_cte);
        assert!(analysis.has_set_operations);
    }

    #[test]
    fn test_analyze_subquery() {
        let analysis = analyze("SELECT * FROM users WHERE id IN (SELECT user_id FROM active)");
        assert_eq!(analysis.subquery_count, 1);
    }

    #[test]
    fn test_complexity_score_is_capped() {
        let analysis = analyze(
            "SELECT DISTINCT a.x, SUM(b.y), AVG(c.z), RANK() OVER (ORDER BY a.x) \
             FROM a JOIN b ON a.id = b.a_id JOIN c ON c.id = b.c_id JOIN d ON d.id = c.d_id \
             WHERE a.p = 1 AND b.q = 2 AND c.r = 3 AND d.s = 4 AND a.id IN (SELECT id FROM e) \
             GROUP BY a.x",
        );
        let complexity = analysis.complexity_score();
        assert_eq!(complexity.score, 10);
        assert!(complexity.factors.contains(&"window functions"));
        assert!(complexity.factors.contains(&"DISTINCT"));
    }
}
