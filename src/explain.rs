//! Backend execution plans as an operator tree.
//!
//! PostgreSQL plans arrive as indented text, one line per row of the
//! `QUERY PLAN` column. SQLite's `EXPLAIN QUERY PLAN` returns
//! `(id, parent, detail)` rows and MySQL's `EXPLAIN` one row per table
//! access. All three are normalized into [`ExecutionPlan`].

use serde::Serialize;

use crate::db::{Record, RecordExt};
use crate::dialect::Dialect;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanNode {
    /// `Seq Scan`, `Hash Join`, `SCAN`, MySQL access type, ...
    pub operator: String,
    pub relation: Option<String>,
    pub estimated_cost: Option<(f64, f64)>,
    pub actual_time: Option<(f64, f64)>,
    pub estimated_rows: Option<u64>,
    pub actual_rows: Option<u64>,
    pub loops: Option<u64>,
    pub details: Vec<String>,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    fn new(operator: &str) -> Self {
        Self {
            operator: operator.to_string(),
            relation: None,
            estimated_cost: None,
            actual_time: None,
            estimated_rows: None,
            actual_rows: None,
            loops: None,
            details: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Reads every row of its relation.
    pub fn is_full_scan(&self) -> bool {
        self.relation.is_some()
            && matches!(
                self.operator.as_str(),
                "Seq Scan" | "Parallel Seq Scan" | "SCAN" | "ALL"
            )
    }

    /// Best row figure the backend gave for this node.
    pub fn rows(&self) -> Option<u64> {
        self.actual_rows.or(self.estimated_rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub root: PlanNode,
    pub planning_time: Option<f64>,
    pub execution_time: Option<f64>,
}

impl ExecutionPlan {
    /// Pre-order walk over every node.
    pub fn nodes(&self) -> Vec<&PlanNode> {
        fn visit<'a>(node: &'a PlanNode, out: &mut Vec<&'a PlanNode>) {
            out.push(node);
            for child in &node.children {
                visit(child, out);
            }
        }
        let mut out = Vec::new();
        visit(&self.root, &mut out);
        out
    }

    pub fn full_scans(&self) -> Vec<&PlanNode> {
        self.nodes().into_iter().filter(|n| n.is_full_scan()).collect()
    }

    /// Largest row figure reported for nodes reading `relation`.
    pub fn relation_rows(&self, relation: &str) -> Option<u64> {
        self.nodes()
            .into_iter()
            .filter(|n| {
                n.relation
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case(relation))
            })
            .filter_map(PlanNode::rows)
            .max()
    }

    /// `Filter:` detail lines, in plan order.
    pub fn filter_lines(&self) -> Vec<&str> {
        self.nodes()
            .into_iter()
            .flat_map(|n| n.details.iter())
            .filter_map(|d| d.strip_prefix("Filter:").map(str::trim))
            .collect()
    }
}

/// Statement that asks `dialect` for a plan without running `sql`.
pub fn explain_statement(dialect: Dialect, sql: &str) -> Option<String> {
    match dialect {
        Dialect::Postgres | Dialect::MySql => Some(format!("EXPLAIN {sql}")),
        Dialect::Sqlite => Some(format!("EXPLAIN QUERY PLAN {sql}")),
        Dialect::MongoDb => None,
    }
}

/// Parse the rows an [`explain_statement`] returned.
pub fn parse_plan_rows(dialect: Dialect, rows: &[Record]) -> Option<ExecutionPlan> {
    match dialect {
        Dialect::Postgres => {
            let lines: Vec<String> = rows
                .iter()
                .filter_map(|r| {
                    r.text("QUERY PLAN")
                        .or_else(|| r.values().next().and_then(|v| v.as_str().map(str::to_string)))
                })
                .collect();
            parse_postgres_text(&lines.join("\n"))
        }
        Dialect::Sqlite => parse_sqlite_rows(rows),
        Dialect::MySql => parse_mysql_rows(rows),
        Dialect::MongoDb => None,
    }
}

pub fn parse_postgres_text(text: &str) -> Option<ExecutionPlan> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let mut planning_time = None;
    let mut execution_time = None;

    // Extract timing info from the end
    for line in lines.iter().rev() {
        let trimmed = line.trim();
        if let Some(time_str) = trimmed
            .strip_prefix("Planning Time:")
            .or_else(|| trimmed.strip_prefix("Planning time:"))
        {
            planning_time = parse_time_ms(time_str);
        } else if let Some(time_str) = trimmed
            .strip_prefix("Execution Time:")
            .or_else(|| trimmed.strip_prefix("Execution time:"))
        {
            execution_time = parse_time_ms(time_str);
        }
    }

    let plan_lines: Vec<&str> = lines
        .iter()
        .filter(|l| {
            let t = l.trim();
            !t.starts_with("Planning Time:")
                && !t.starts_with("Planning time:")
                && !t.starts_with("Execution Time:")
                && !t.starts_with("Execution time:")
                && !t.starts_with("QUERY PLAN")
                && !t.starts_with("---")
                && !t.is_empty()
        })
        .copied()
        .collect();

    if plan_lines.is_empty() {
        return None;
    }

    let root = parse_node(&plan_lines, 0).0?;
    Some(ExecutionPlan {
        root,
        planning_time,
        execution_time,
    })
}

fn parse_time_ms(s: &str) -> Option<f64> {
    let s = s.trim().trim_end_matches("ms").trim();
    s.parse::<f64>().ok()
}

fn parse_node(lines: &[&str], start: usize) -> (Option<PlanNode>, usize) {
    if start >= lines.len() {
        return (None, start);
    }

    let first_line = lines[start];
    let node_indent = get_indent(first_line);
    let content = first_line.trim().trim_start_matches("->").trim();
    let mut node = parse_node_header(content);

    let mut idx = start + 1;
    while idx < lines.len() {
        let line = lines[idx];
        let indent = get_indent(line);
        let trimmed = line.trim();

        if indent <= node_indent {
            // Back at same or lower indent level; this line belongs to the parent
            break;
        }

        if trimmed.starts_with("->") {
            let (child, next_idx) = parse_node(lines, idx);
            if let Some(child) = child {
                node.children.push(child);
            }
            idx = next_idx;
        } else {
            node.details.push(trimmed.to_string());
            idx += 1;
        }
    }

    (Some(node), idx)
}

fn get_indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// `Seq Scan on orders o  (cost=0.00..35.50 rows=2550 width=36) (actual ...)`
fn parse_node_header(s: &str) -> PlanNode {
    let (label, rest) = match s.find("(cost=") {
        Some(pos) => (s[..pos].trim(), &s[pos..]),
        None => (s.trim(), ""),
    };

    let mut node = match label.split_once(" on ") {
        Some((operator, target)) => {
            let mut node = PlanNode::new(operator.trim());
            node.relation = target
                .split_whitespace()
                .next()
                .map(|r| r.rsplit('.').next().unwrap_or(r).to_string());
            node
        }
        None => PlanNode::new(label),
    };

    if rest.is_empty() {
        return node;
    }

    node.estimated_cost = extract_between(rest, "(cost=", " ").and_then(parse_range);
    node.estimated_rows = extract_between(rest, "rows=", " ").and_then(|r| r.parse().ok());

    if let Some(actual_pos) = rest.find("(actual") {
        let actual = &rest[actual_pos..];
        node.actual_time = extract_between(actual, "time=", " ").and_then(parse_range);
        node.actual_rows = extract_between(actual, "rows=", " ").and_then(|r| r.parse().ok());
        node.loops = extract_between(actual, "loops=", ")").and_then(|r| r.parse().ok());
    }
    node
}

fn parse_range(s: &str) -> Option<(f64, f64)> {
    let (a, b) = s.split_once("..")?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn extract_between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_pos = s.find(start)? + start.len();
    let remaining = &s[start_pos..];
    let end_pos = remaining.find(end)?;
    Some(&remaining[..end_pos])
}

/// `SCAN orders`, `SCAN TABLE orders AS o`, `SEARCH o USING INDEX ...`
fn parse_sqlite_detail(detail: &str) -> PlanNode {
    let mut words = detail.split_whitespace();
    let operator = words.next().unwrap_or_default();
    let mut node = PlanNode::new(operator);
    node.details.push(detail.to_string());
    if matches!(operator, "SCAN" | "SEARCH") {
        let mut target = words.next();
        if target == Some("TABLE") {
            target = words.next();
        }
        node.relation = target.map(str::to_string);
        if detail.contains("USING COVERING INDEX") {
            node.operator = "SCAN INDEX".to_string();
        }
    }
    node
}

pub fn parse_sqlite_rows(rows: &[Record]) -> Option<ExecutionPlan> {
    let entries: Vec<(i64, i64, String)> = rows
        .iter()
        .filter_map(|r| Some((r.int("id")?, r.int("parent").unwrap_or(0), r.text("detail")?)))
        .collect();
    if entries.is_empty() {
        return None;
    }

    fn children_of(parent: i64, entries: &[(i64, i64, String)]) -> Vec<PlanNode> {
        entries
            .iter()
            .filter(|(id, p, _)| *p == parent && *id != parent)
            .map(|(id, _, detail)| {
                let mut node = parse_sqlite_detail(detail);
                node.children = children_of(*id, entries);
                node
            })
            .collect()
    }

    let mut root = PlanNode::new("QUERY PLAN");
    root.children = children_of(0, &entries);
    Some(ExecutionPlan {
        root,
        planning_time: None,
        execution_time: None,
    })
}

pub fn parse_mysql_rows(rows: &[Record]) -> Option<ExecutionPlan> {
    let mut root = PlanNode::new("QUERY PLAN");
    for row in rows {
        let Some(access) = row.text("type") else {
            continue;
        };
        let mut node = PlanNode::new(&access);
        node.relation = row.text("table");
        node.estimated_rows = row.int("rows").and_then(|r| u64::try_from(r).ok());
        if let Some(key) = row.text("key") {
            node.details.push(format!("Key: {key}"));
        }
        if let Some(extra) = row.text("Extra") {
            node.details.push(extra);
        }
        root.children.push(node);
    }
    (!root.children.is_empty()).then_some(ExecutionPlan {
        root,
        planning_time: None,
        execution_time: None,
    })
}
