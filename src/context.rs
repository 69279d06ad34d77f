//! Selects the part of the schema a question needs and serializes it for
//! the prompt.
//!
//! Tables are scored by how many question tokens they mention, widened
//! along foreign keys, and trimmed from the least relevant end until the
//! serialized context fits `context.max_chars`. Tables the previous turn
//! used are pinned and survive trimming.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::ContextConfig;
use crate::dialect::Dialect;
use crate::history::HistoryTurn;
use crate::schema::{SchemaConfidence, SchemaGraph, TableMeta};

const TABLE_WEIGHT: f64 = 3.0;
const COLUMN_WEIGHT: f64 = 1.0;
const FRAGMENT_WEIGHT: f64 = 0.5;

const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "by", "can", "could", "did",
    "do", "does", "each", "find", "for", "from", "get", "give", "has", "have", "how", "i", "in",
    "into", "is", "it", "its", "list", "many", "me", "much", "my", "of", "on", "or", "our", "per",
    "please", "show", "than", "that", "the", "their", "there", "these", "this", "those", "to",
    "us", "was", "we", "were", "what", "which", "who", "with",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedTable {
    pub name: String,
    pub relevance: f64,
    /// Referenced by the previous turn; never trimmed.
    pub pinned: bool,
}

/// Everything the orchestrator needs for one question.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub question: String,
    pub schema: Arc<SchemaGraph>,
    /// Serialized schema subset.
    pub context: String,
    /// Most relevant first.
    pub tables: Vec<SelectedTable>,
    /// Oldest first, at most `history_window` turns.
    pub history: Vec<HistoryTurn>,
    pub dialect: Dialect,
}

pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        question: &str,
        schema: Arc<SchemaGraph>,
        history: &[HistoryTurn],
        dialect: Dialect,
    ) -> TranslationRequest {
        let pinned: BTreeSet<String> = history
            .last()
            .map(|turn| {
                turn.tables
                    .iter()
                    .filter(|t| schema.table(t).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut scores = direct_scores(question, &schema);
        if scores.is_empty() {
            scores = schema.tables().map(|t| (t.name.clone(), 1.0)).collect();
        } else {
            self.widen_along_foreign_keys(&schema, &mut scores);
        }
        for name in &pinned {
            scores.entry(name.clone()).or_insert(0.0);
        }

        let mut selected: Vec<SelectedTable> = scores
            .into_iter()
            .map(|(name, relevance)| SelectedTable {
                pinned: pinned.contains(&name),
                name,
                relevance,
            })
            .collect();
        selected.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| a.name.cmp(&b.name))
        });

        let context = self.fit(&schema, &mut selected);
        let window = self.config.history_window.min(history.len());
        let history = history[history.len() - window..].to_vec();

        debug!(
            tables = selected.len(),
            chars = context.chars().count(),
            turns = history.len(),
            "context built"
        );

        TranslationRequest {
            question: question.to_string(),
            schema,
            context,
            tables: selected,
            history,
            dialect,
        }
    }

    fn widen_along_foreign_keys(&self, schema: &SchemaGraph, scores: &mut BTreeMap<String, f64>) {
        let seeds: Vec<(String, f64)> = scores.iter().map(|(n, s)| (n.clone(), *s)).collect();
        for (seed, relevance) in seeds {
            let mut visited = BTreeSet::from([seed.clone()]);
            let mut queue = VecDeque::from([(seed, 0usize)]);
            while let Some((name, hops)) = queue.pop_front() {
                if hops == self.config.fk_depth {
                    continue;
                }
                for next in schema.neighbors(&name) {
                    if !visited.insert(next.to_string()) {
                        continue;
                    }
                    let decayed = relevance * self.config.fk_decay.powi(hops as i32 + 1);
                    let entry = scores.entry(next.to_string()).or_insert(0.0);
                    *entry = entry.max(decayed);
                    queue.push_back((next.to_string(), hops + 1));
                }
            }
        }
    }

    /// Serialize `selected`, dropping unpinned tables from the least
    /// relevant end until the text fits.
    fn fit(&self, schema: &SchemaGraph, selected: &mut Vec<SelectedTable>) -> String {
        let blocks: BTreeMap<String, String> = selected
            .iter()
            .filter_map(|t| schema.table(&t.name).map(|meta| (t.name.clone(), describe(meta))))
            .collect();
        let size = |tables: &[SelectedTable]| -> usize {
            tables
                .iter()
                .filter_map(|t| blocks.get(&t.name))
                .map(|b| b.chars().count() + 1)
                .sum()
        };

        while size(selected) > self.config.max_chars {
            // sorted by relevance desc then name asc, so the last unpinned
            // entry is the lowest relevance with the greatest name
            match selected.iter().rposition(|t| !t.pinned) {
                Some(idx) => {
                    let dropped = selected.remove(idx);
                    debug!(table = %dropped.name, relevance = dropped.relevance, "trimmed from context");
                }
                None => break,
            }
        }

        selected
            .iter()
            .filter_map(|t| blocks.get(&t.name))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .map(|w| fold(&w))
        .collect()
}

/// Naive singular form.
fn fold(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies").filter(|s| s.len() > 1) {
        return format!("{stem}y");
    }
    for suffix in ["sses", "uses", "xes"] {
        if word.len() > suffix.len() + 1 && word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

fn direct_scores(question: &str, schema: &SchemaGraph) -> BTreeMap<String, f64> {
    let tokens = tokenize(question);
    let mut scores = BTreeMap::new();
    for table in schema.tables() {
        let mut score = 0.0;
        if tokens.contains(&fold(&table.name.to_lowercase())) {
            score += TABLE_WEIGHT;
        }
        for column in &table.columns {
            let name = column.name.to_lowercase();
            if tokens.contains(&fold(&name)) {
                score += COLUMN_WEIGHT;
                continue;
            }
            let fragments: Vec<&str> = name.split(['_', '.']).filter(|f| !f.is_empty()).collect();
            if fragments.len() > 1 {
                score += FRAGMENT_WEIGHT
                    * fragments
                        .iter()
                        .filter(|f| tokens.contains(&fold(f)))
                        .count() as f64;
            }
        }
        if score > 0.0 {
            scores.insert(table.name.clone(), score);
        }
    }
    scores
}

fn describe(table: &TableMeta) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} {}", table.kind.label(), table.name);
    if let Some(rows) = table.row_count {
        let _ = write!(out, " (~{rows} rows)");
    }
    out.push('\n');

    for column in &table.columns {
        let _ = write!(out, "  {} {}", column.name, column.data_type);
        if table.primary_key.iter().any(|pk| pk == &column.name) {
            out.push_str(" PK");
        } else if !column.nullable {
            out.push_str(" NOT NULL");
        }
        if column.confidence == SchemaConfidence::Inferred {
            out.push_str(" (sampled)");
        }
        for fk in table.foreign_keys.iter().filter(|fk| fk.column == column.name) {
            let _ = write!(out, " -> {}.{}", fk.target_table, fk.target_column);
        }
        out.push('\n');
    }
    for index in table.indexes.iter().filter(|i| !i.primary) {
        let _ = writeln!(
            out,
            "  {}INDEX {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            index.name,
            index.columns.join(", ")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::TurnOutcome;
    use crate::schema::{ColumnMeta, ForeignKey, TableKind};

    fn table(name: &str, cols: &[&str], fks: &[(&str, &str)]) -> TableMeta {
        let mut t = TableMeta::new(name, TableKind::Table);
        t.columns = cols
            .iter()
            .map(|c| ColumnMeta::declared(c, "integer", false))
            .collect();
        t.primary_key = vec!["id".into()];
        t.foreign_keys = fks
            .iter()
            .map(|(col, target)| ForeignKey {
                column: col.to_string(),
                target_table: target.to_string(),
                target_column: "id".into(),
            })
            .collect();
        t
    }

    /// regions <- customers <- orders <- order_items -> products, plus a
    /// disconnected audit_log.
    fn store() -> Arc<SchemaGraph> {
        Arc::new(
            SchemaGraph::new(
                Dialect::Postgres,
                vec![
                    table("regions", &["id", "label"], &[]),
                    table("customers", &["id", "name", "region_id"], &[("region_id", "regions")]),
                    table(
                        "orders",
                        &["id", "customer_id", "created_at", "amount"],
                        &[("customer_id", "customers")],
                    ),
                    table(
                        "order_items",
                        &["id", "order_id", "product_id", "quantity"],
                        &[("order_id", "orders"), ("product_id", "products")],
                    ),
                    table("products", &["id", "title", "price"], &[]),
                    table("audit_log", &["id", "event"], &[]),
                ],
            )
            .unwrap(),
        )
    }

    fn turn(tables: &[&str]) -> HistoryTurn {
        HistoryTurn {
            question: "earlier".into(),
            sql: Some("SELECT 1".into()),
            outcome: TurnOutcome::Succeeded { rows: None },
            tables: tables.iter().map(|t| t.to_string()).collect(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn relevance(request: &TranslationRequest, name: &str) -> Option<f64> {
        request
            .tables
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.relevance)
    }

    #[test]
    fn test_tokenize_folds_and_drops_stop_words() {
        let tokens = tokenize("Show the total Orders per customer for categories and boxes");
        let expected: BTreeSet<String> = ["total", "order", "customer", "category", "box"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_fold() {
        assert_eq!(fold("addresses"), "address");
        assert_eq!(fold("statuses"), "status");
        assert_eq!(fold("status"), "status");
        assert_eq!(fold("cases"), "case");
        assert_eq!(fold("bus"), "bus");
    }

    #[test]
    fn test_scores_and_foreign_key_closure() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let request = builder.build("total amount of orders", store(), &[], Dialect::Postgres);

        // table name 3 + column 1
        assert_eq!(relevance(&request, "orders"), Some(4.0));
        // one hop, decayed once
        assert_eq!(relevance(&request, "customers"), Some(2.0));
        assert_eq!(relevance(&request, "order_items"), Some(2.0));
        // two hops
        assert_eq!(relevance(&request, "regions"), Some(1.0));
        assert_eq!(relevance(&request, "products"), Some(1.0));
        assert_eq!(relevance(&request, "audit_log"), None);
        assert_eq!(request.tables[0].name, "orders");
        assert!(request.context.starts_with("TABLE orders"));
    }

    #[test]
    fn test_fragment_weight() {
        let builder = ContextBuilder::new(ContextConfig {
            fk_depth: 0,
            ..Default::default()
        });
        let request = builder.build("which product sold best", store(), &[], Dialect::Postgres);
        // products by name, order_items by the product_id fragment
        assert_eq!(relevance(&request, "products"), Some(3.0));
        assert_eq!(relevance(&request, "order_items"), Some(0.5));
    }

    #[test]
    fn test_no_match_uses_every_table() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let request = builder.build("how are things going", store(), &[], Dialect::Sqlite);
        assert_eq!(request.tables.len(), 6);
        assert!(request.tables.iter().all(|t| t.relevance == 1.0));
        assert_eq!(request.tables[0].name, "audit_log");
    }

    #[test]
    fn test_truncation_keeps_pinned_tables() {
        let schema = store();
        let builder = ContextBuilder::new(ContextConfig {
            max_chars: 200,
            ..Default::default()
        });
        let history = vec![turn(&["audit_log"])];
        let request = builder.build("total amount of orders", schema, &history, Dialect::Postgres);

        let names: Vec<&str> = request.tables.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"audit_log"));
        assert!(request.tables.iter().find(|t| t.name == "audit_log").unwrap().pinned);
        assert!(names.contains(&"orders"));
        assert!(!names.contains(&"products"));
        assert!(!names.contains(&"customers"));
        assert!(request.context.contains("TABLE audit_log"));
    }

    #[test]
    fn test_trim_ties_drop_greatest_name_first() {
        let builder = ContextBuilder::new(ContextConfig {
            max_chars: 0,
            ..Default::default()
        });
        let mut selected = vec![
            SelectedTable {
                name: "customers".into(),
                relevance: 1.0,
                pinned: true,
            },
            SelectedTable {
                name: "products".into(),
                relevance: 1.0,
                pinned: false,
            },
        ];
        let text = builder.fit(&store(), &mut selected);
        assert_eq!(selected.len(), 1);
        assert!(text.starts_with("TABLE customers"));
    }

    #[test]
    fn test_history_window() {
        let builder = ContextBuilder::new(ContextConfig {
            history_window: 2,
            ..Default::default()
        });
        let history: Vec<HistoryTurn> = (0..4)
            .map(|i| HistoryTurn {
                question: format!("q{i}"),
                ..turn(&[])
            })
            .collect();
        let request = builder.build("orders", store(), &history, Dialect::Postgres);
        let questions: Vec<&str> = request.history.iter().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3"]);
    }

    #[test]
    fn test_deterministic() {
        let builder = ContextBuilder::new(ContextConfig::default());
        let schema = store();
        let a = builder.build("orders by customer", schema.clone(), &[], Dialect::Postgres);
        let b = builder.build("orders by customer", schema, &[], Dialect::Postgres);
        assert_eq!(a.context, b.context);
        assert_eq!(a.tables, b.tables);
    }

    #[test]
    fn test_describe_marks_keys_and_indexes() {
        let schema = store();
        let text = describe(schema.table("orders").unwrap());
        assert!(text.contains("  id integer PK"));
        assert!(text.contains("customer_id integer NOT NULL -> customers.id"));
    }
}
