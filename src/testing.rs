//! Fixtures and in-memory fakes for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::{DbError, DeclaredField, DocumentConnection, Record, RelationalConnection};
use crate::dialect::Dialect;
use crate::schema::{
    ColumnMeta, ForeignKey, IndexMeta, SchemaConfidence, SchemaGraph, TableKind, TableMeta,
};
use crate::translate::{Completion, CompletionError, CompletionOptions, CompletionService, Prompt};

fn primary_index(table: &str) -> IndexMeta {
    IndexMeta {
        name: format!("{table}_pkey"),
        columns: vec!["id".into()],
        unique: true,
        primary: true,
    }
}

fn shop_tables() -> Vec<TableMeta> {
    let mut customers = TableMeta::new("customers", TableKind::Table);
    customers.columns = vec![
        ColumnMeta::declared("id", "integer", false),
        ColumnMeta::declared("name", "text", false),
        ColumnMeta::declared("email", "text", true),
    ];
    customers.primary_key = vec!["id".into()];
    customers.indexes = vec![primary_index("customers")];
    customers.row_count = Some(2_000);

    let mut orders = TableMeta::new("orders", TableKind::Table);
    orders.columns = vec![
        ColumnMeta::declared("id", "integer", false),
        ColumnMeta::declared("customer_id", "integer", false),
        ColumnMeta::declared("created_at", "timestamp with time zone", false),
        ColumnMeta::declared("amount", "numeric", false),
        ColumnMeta {
            distinct_estimate: Some(4.0),
            ..ColumnMeta::declared("status", "text", false)
        },
    ];
    orders.primary_key = vec!["id".into()];
    orders.foreign_keys = vec![ForeignKey {
        column: "customer_id".into(),
        target_table: "customers".into(),
        target_column: "id".into(),
    }];
    orders.indexes = vec![primary_index("orders")];
    orders.row_count = Some(50_000);

    vec![customers, orders]
}

/// `customers(id, name, email)` and `orders(id, customer_id, created_at,
/// amount, status)` on PostgreSQL, with only primary-key indexes and 50k orders.
pub(crate) fn shop_schema() -> SchemaGraph {
    SchemaGraph::new(Dialect::Postgres, shop_tables()).expect("shop schema is closed")
}

/// [`shop_schema`] plus an index on `orders.customer_id`.
pub(crate) fn indexed_shop_schema() -> SchemaGraph {
    let mut tables = shop_tables();
    tables[1].indexes.push(IndexMeta {
        name: "idx_orders_customer_id".into(),
        columns: vec!["customer_id".into()],
        unique: false,
        primary: false,
    });
    SchemaGraph::new(Dialect::Postgres, tables).expect("shop schema is closed")
}

/// A sampled `orders` collection.
pub(crate) fn mongo_schema() -> SchemaGraph {
    let inferred = |name: &str, data_type: &str, nullable: bool| ColumnMeta {
        confidence: SchemaConfidence::Inferred,
        ..ColumnMeta::declared(name, data_type, nullable)
    };
    let mut orders = TableMeta::new("orders", TableKind::Collection);
    orders.columns = vec![
        inferred("_id", "string", false),
        inferred("amount", "double|int", false),
        inferred("created_at", "string", false),
        inferred("customer.name", "string", true),
        inferred("customer_id", "string", false),
        inferred("status", "string", false),
    ];
    orders.primary_key = vec!["_id".into()];
    orders.row_count = Some(100);
    SchemaGraph::new(Dialect::MongoDb, vec![orders]).expect("collection schema is closed")
}

fn records(rows: Value) -> Vec<Record> {
    match rows {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Relational connection answering by substring match on the SQL text.
/// The first matching rule wins; unmatched statements return no rows.
pub(crate) struct FakeRelational {
    backend: Dialect,
    rules: Vec<(String, Result<Vec<Record>, DbError>)>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl FakeRelational {
    pub(crate) fn new(backend: Dialect) -> Self {
        Self {
            backend,
            rules: Vec::new(),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond(mut self, needle: &str, rows: Value) -> Self {
        self.rules.push((needle.to_string(), Ok(records(rows))));
        self
    }

    pub(crate) fn fail(mut self, needle: &str, err: DbError) -> Self {
        self.rules.push((needle.to_string(), Err(err)));
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RelationalConnection for FakeRelational {
    fn backend(&self) -> Dialect {
        self.backend
    }

    async fn query(&self, sql: &str) -> Result<Vec<Record>, DbError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.rules
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
pub(crate) struct FakeDocument {
    collections: BTreeMap<String, Vec<Value>>,
}

impl FakeDocument {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn collection(mut self, name: &str, docs: Vec<Value>) -> Self {
        self.collections.insert(name.to_string(), docs);
        self
    }
}

#[async_trait]
impl DocumentConnection for FakeDocument {
    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        Ok(self.collections.keys().cloned().collect())
    }

    async fn find(
        &self,
        collection: &str,
        _filter: &Value,
        limit: usize,
    ) -> Result<Vec<Value>, DbError> {
        let docs = self
            .collections
            .get(collection)
            .ok_or_else(|| DbError::Rejected(format!("no collection {collection}")))?;
        Ok(docs.iter().take(limit).cloned().collect())
    }

    async fn declared_fields(&self, _collection: &str) -> Result<Vec<DeclaredField>, DbError> {
        Ok(Vec::new())
    }

    async fn list_indexes(&self, _collection: &str) -> Result<Vec<IndexMeta>, DbError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Respond(String),
    Fail(CompletionError),
    /// Never completes; only a timeout ends the attempt.
    Hang,
}

/// Completion service replaying a fixed script, one step per call.
pub(crate) struct ScriptedCompletion {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedCompletion {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().ok().and_then(|p| p.last().cloned())
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        prompt: &Prompt,
        _options: &CompletionOptions,
    ) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        match step {
            Some(Step::Respond(text)) => Ok(Completion {
                text,
                finish_reason: Some("stop".into()),
                model: Some("scripted".into()),
            }),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(CompletionError::Rejected("script exhausted".into())),
        }
    }
}
