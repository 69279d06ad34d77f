//! Build a [`SchemaGraph`] from a live connection.
//!
//! The table (or collection) listing is one query; per-table detail
//! queries run on a `JoinSet`, at most `max_concurrency` at a time. Results
//! are merged by name so the graph does not depend on completion order.
//! Every metadata call is bounded by `query_timeout_ms`; a call that runs
//! out of time counts as an unreachable backend.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::catalog::{self, Catalog, TableListing};
use super::document::infer_collection;
use super::graph::{ForeignKey, SchemaGraph, TableMeta};
use crate::config::IntrospectionConfig;
use crate::db::{ConnectionHandle, DbError, DocumentConnection, RecordExt, RelationalConnection};
use crate::error::{PipelineError, PipelineResult};

pub async fn introspect(
    handle: &ConnectionHandle,
    config: &IntrospectionConfig,
) -> PipelineResult<SchemaGraph> {
    let dialect = handle.dialect();
    let tables = match handle {
        ConnectionHandle::Relational(conn) => introspect_relational(conn, config).await?,
        ConnectionHandle::Document(conn) => introspect_documents(conn, config).await?,
    };
    let tables = close_foreign_keys(tables);
    info!(%dialect, tables = tables.len(), "schema introspected");
    SchemaGraph::new(dialect, tables)
}

async fn introspect_relational(
    conn: &Arc<dyn RelationalConnection>,
    config: &IntrospectionConfig,
) -> PipelineResult<Vec<TableMeta>> {
    let dialect = conn.backend();
    let catalog = Catalog::for_backend(dialect, &config.schema).ok_or_else(|| {
        PipelineError::Introspection(format!("{dialect} has no relational catalog"))
    })?;

    let limit = config.query_timeout();
    let rows = bounded(limit, conn.query(&catalog.list_tables()))
        .await
        .map_err(DbError::into_introspection)?;
    let listing = catalog::parse_table_list(&rows).map_err(DbError::into_introspection)?;
    debug!(count = listing.len(), "listed tables");

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for entry in listing {
        let conn = Arc::clone(conn);
        let catalog = catalog.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| DbError::Unreachable(e.to_string()))?;
            describe_table(conn.as_ref(), &catalog, entry, limit).await
        });
    }

    collect(tasks).await
}

async fn describe_table(
    conn: &dyn RelationalConnection,
    catalog: &Catalog,
    entry: TableListing,
    limit: Duration,
) -> Result<TableMeta, DbError> {
    let query = |sql: String| bounded(limit, async move { conn.query(&sql).await });

    let mut table = TableMeta::new(&entry.name, entry.kind);
    table.row_count = entry.row_count;

    let (columns, primary_key) = catalog::parse_columns(&query(catalog.columns(&entry.name)).await?)?;
    table.columns = columns;
    table.primary_key = primary_key;
    table.foreign_keys =
        catalog::parse_foreign_keys(&query(catalog.foreign_keys(&entry.name)).await?)?;
    table.indexes = catalog::parse_indexes(&query(catalog.indexes(&entry.name)).await?)?;

    if table.row_count.is_none() {
        if let Some(sql) = catalog.row_count(&entry.name) {
            let rows = query(sql).await?;
            table.row_count = rows
                .first()
                .and_then(|r| r.int("row_count"))
                .map(|n| n.max(0) as u64);
        }
    }
    if let Some(sql) = catalog.column_stats(&entry.name) {
        let rows = query(sql).await?;
        catalog::apply_column_stats(&mut table.columns, &rows, table.row_count);
    }

    debug!(
        table = %table.name,
        columns = table.columns.len(),
        foreign_keys = table.foreign_keys.len(),
        indexes = table.indexes.len(),
        "described table"
    );
    Ok(table)
}

async fn introspect_documents(
    conn: &Arc<dyn DocumentConnection>,
    config: &IntrospectionConfig,
) -> PipelineResult<Vec<TableMeta>> {
    let limit = config.query_timeout();
    let mut names = bounded(limit, conn.list_collections())
        .await
        .map_err(DbError::into_introspection)?;
    names.retain(|n| !n.starts_with("system."));
    debug!(count = names.len(), "listed collections");

    let sample_size = config.document_sample_size;
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for name in names {
        let conn = Arc::clone(conn);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| DbError::Unreachable(e.to_string()))?;
            let samples = bounded(limit, conn.find(&name, &json!({}), sample_size)).await?;
            let declared = bounded(limit, conn.declared_fields(&name)).await?;
            let indexes = bounded(limit, conn.list_indexes(&name)).await?;
            let count = bounded(limit, conn.estimated_count(&name)).await?;
            Ok(infer_collection(&name, &samples, &declared, indexes, count))
        });
    }

    collect(tasks).await
}

/// One metadata call under the per-query time limit.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DbError>>,
) -> Result<T, DbError> {
    tokio::time::timeout(limit, call).await.map_err(|_| {
        DbError::Unreachable(format!(
            "metadata query timed out after {}ms",
            limit.as_millis()
        ))
    })?
}

/// Await every task; the first failure aborts the rest.
async fn collect(mut tasks: JoinSet<Result<TableMeta, DbError>>) -> PipelineResult<Vec<TableMeta>> {
    let mut tables = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let table = joined
            .map_err(|e| PipelineError::Introspection(format!("introspection task failed: {e}")))?
            .map_err(DbError::into_introspection)?;
        tables.push(table);
    }
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tables)
}

/// Fill implicit FK targets with the target's primary key and drop edges
/// that leave the introspected set.
fn close_foreign_keys(mut tables: Vec<TableMeta>) -> Vec<TableMeta> {
    let index: BTreeMap<String, (Vec<String>, Vec<String>)> = tables
        .iter()
        .map(|t| {
            (
                t.name.clone(),
                (
                    t.columns.iter().map(|c| c.name.clone()).collect(),
                    t.primary_key.clone(),
                ),
            )
        })
        .collect();

    for table in &mut tables {
        let owner = table.name.clone();
        table.foreign_keys = std::mem::take(&mut table.foreign_keys)
            .into_iter()
            .filter_map(|mut fk: ForeignKey| {
                let Some((columns, pk)) = index.get(&fk.target_table) else {
                    warn!(table = %owner, column = %fk.column, references = %fk.target_table, "dropping foreign key to table outside the schema");
                    return None;
                };
                if fk.target_column.is_empty() {
                    match pk.as_slice() {
                        [only] => fk.target_column = only.clone(),
                        _ => {
                            warn!(table = %owner, column = %fk.column, "dropping foreign key with no resolvable target column");
                            return None;
                        }
                    }
                }
                if !columns.contains(&fk.target_column) {
                    warn!(table = %owner, column = %fk.column, references = %fk.target_table, "dropping foreign key to missing column");
                    return None;
                }
                Some(fk)
            })
            .collect();
    }
    tables
}
