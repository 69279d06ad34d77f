//! Scope-aware resolution of table and column references.
//!
//! Every relation and column in the statement must resolve against the
//! schema graph, a CTE, a derived table, or a projection alias. Resolved
//! names are rewritten to their catalog spelling so that later stages
//! render them consistently.

use std::collections::BTreeSet;

use super::safety;
use super::ColumnRef;
use crate::ast::*;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::{SchemaGraph, TableMeta};

#[derive(Debug, Clone)]
enum Source<'a> {
    Table {
        binding: String,
        table: &'a TableMeta,
    },
    /// CTE, derived table or table function; `None` when its output
    /// columns are unknown, which only qualified references can reach.
    Derived {
        binding: String,
        columns: Option<Vec<String>>,
    },
}

impl Source<'_> {
    fn binding(&self) -> Option<&str> {
        match self {
            Source::Table { binding, .. } | Source::Derived { binding, .. } => Some(binding),
        }
    }

    fn columns(&self) -> Option<Vec<String>> {
        match self {
            Source::Table { table, .. } => {
                Some(table.columns.iter().map(|c| c.name.clone()).collect())
            }
            Source::Derived { columns, .. } => columns.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Scope<'a> {
    sources: Vec<Source<'a>>,
    /// Projection aliases, visible to GROUP BY, HAVING and ORDER BY.
    aliases: Vec<String>,
}

impl<'a> Scope<'a> {
    /// The only source, when it is an inferred collection.
    fn single_collection(&self) -> Option<&'a TableMeta> {
        match self.sources.as_slice() {
            [Source::Table { table, .. }] if table.is_inferred() => Some(*table),
            _ => None,
        }
    }
}

struct CteBinding {
    name: String,
    columns: Option<Vec<String>>,
}

pub(super) struct Resolver<'a> {
    schema: &'a SchemaGraph,
    case_insensitive: bool,
    denied_functions: &'a [String],
    sql: &'a str,
    ctes: Vec<CteBinding>,
    tables: BTreeSet<String>,
    columns: BTreeSet<ColumnRef>,
    notes: Vec<String>,
}

/// Everything the resolver recorded.
pub(super) struct Resolved {
    pub tables: BTreeSet<String>,
    pub columns: BTreeSet<ColumnRef>,
    pub notes: Vec<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        schema: &'a SchemaGraph,
        case_insensitive: bool,
        denied_functions: &'a [String],
        sql: &'a str,
    ) -> Self {
        Self {
            schema,
            case_insensitive,
            denied_functions,
            sql,
            ctes: Vec::new(),
            tables: BTreeSet::new(),
            columns: BTreeSet::new(),
            notes: Vec::new(),
        }
    }

    pub fn resolve_statement(&mut self, query: &mut Query) -> PipelineResult<()> {
        self.resolve_query(query, &[]).map(|_| ())
    }

    pub fn finish(self) -> Resolved {
        Resolved {
            tables: self.tables,
            columns: self.columns,
            notes: self.notes,
        }
    }

    fn mismatch(&self, identifier: impl Into<String>) -> PipelineError {
        PipelineError::SchemaMismatch {
            identifier: identifier.into(),
            statement: self.sql.to_string(),
        }
    }

    fn refuse(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::unsafe_statement(reason, self.sql)
    }

    fn name_eq(&self, a: &str, b: &str) -> bool {
        a == b || (self.case_insensitive && a.eq_ignore_ascii_case(b))
    }

    fn note(&mut self, note: String) {
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    fn lookup_table(&self, name: &str) -> Option<&'a TableMeta> {
        self.schema
            .find_table(name, true)
            .filter(|t| t.name == name || self.case_insensitive || t.is_inferred())
    }

    /// Output columns of the statement, when known.
    fn resolve_query(
        &mut self,
        query: &mut Query,
        outer: &[Scope<'a>],
    ) -> PipelineResult<Option<Vec<String>>> {
        match query {
            Query::Select(select) => self.resolve_select(select, outer),
            Query::With(with) => {
                let mark = self.ctes.len();
                for cte in with.ctes.iter_mut() {
                    let declared = (!cte.columns.is_empty()).then(|| cte.columns.clone());
                    if with.recursive {
                        let columns = match &declared {
                            Some(columns) => Some(columns.clone()),
                            None => self.anchor_columns(&cte.query, outer)?,
                        };
                        self.ctes.push(CteBinding {
                            name: cte.name.clone(),
                            columns,
                        });
                    }
                    let output = self.resolve_query(&mut cte.query, outer)?;
                    if with.recursive {
                        self.ctes.pop();
                    }
                    self.ctes.push(CteBinding {
                        name: cte.name.clone(),
                        columns: declared.or(output),
                    });
                }
                let output = self.resolve_query(&mut with.body, outer);
                self.ctes.truncate(mark);
                output
            }
            Query::Insert(insert) => {
                let (source, table) = self.resolve_target(&mut insert.table, outer)?;
                for column in insert.columns.iter_mut() {
                    if !self.bind_table_column(table, column) {
                        return Err(self.mismatch(format!("{}.{}", table.name, column)));
                    }
                }
                match &mut insert.source {
                    InsertSource::Values(rows) => {
                        for value in rows.iter_mut().flatten() {
                            self.resolve_expr(value, outer, false)?;
                        }
                    }
                    InsertSource::Query(q) => {
                        self.resolve_query(q, outer)?;
                    }
                }
                let stack = push_scope(outer, vec![source]);
                self.resolve_projection(&mut insert.returning, &stack)
            }
            Query::Update(update) => {
                let (source, table) = self.resolve_target(&mut update.table, outer)?;
                let stack = push_scope(outer, vec![source]);
                for assignment in update.assignments.iter_mut() {
                    if !self.bind_table_column(table, &mut assignment.column) {
                        return Err(self.mismatch(format!("{}.{}", table.name, assignment.column)));
                    }
                    self.resolve_expr(&mut assignment.value, &stack, false)?;
                }
                if let Some(filter) = update.filter.as_mut() {
                    self.resolve_expr(filter, &stack, false)?;
                }
                self.resolve_projection(&mut update.returning, &stack)
            }
            Query::Delete(delete) => {
                let (source, _) = self.resolve_target(&mut delete.table, outer)?;
                let stack = push_scope(outer, vec![source]);
                if let Some(filter) = delete.filter.as_mut() {
                    self.resolve_expr(filter, &stack, false)?;
                }
                self.resolve_projection(&mut delete.returning, &stack)
            }
            Query::Ddl(ddl) => Err(self.refuse(format!(
                "DDL is only allowed as a top-level statement: {}",
                ddl.sql
            ))),
            Query::Raw(text) => Err(self.refuse(format!("statement not allowed: {text}"))),
        }
    }

    fn resolve_select(
        &mut self,
        select: &mut SelectQuery,
        outer: &[Scope<'a>],
    ) -> PipelineResult<Option<Vec<String>>> {
        let mut sources = Vec::with_capacity(select.from.len() + select.joins.len());
        for table in select.from.iter_mut() {
            let source = self.resolve_from_item(table, outer, &sources)?;
            sources.push(source);
        }
        for join in select.joins.iter_mut() {
            let source = self.resolve_from_item(&mut join.table, outer, &sources)?;
            sources.push(source);
        }
        let mut stack = push_scope(outer, sources);

        for join in select.joins.iter_mut() {
            match join.condition.as_mut() {
                Some(JoinCondition::On(expr)) => self.resolve_expr(expr, &stack, false)?,
                Some(JoinCondition::Using(columns)) => {
                    for column in columns.iter_mut() {
                        self.resolve_column(&mut None, column, &stack, false, true)?;
                    }
                }
                Some(JoinCondition::Natural) | None => {}
            }
        }

        let output = self.resolve_projection(&mut select.projections, &stack)?;
        if let Some(scope) = stack.last_mut() {
            scope.aliases = select
                .projections
                .iter()
                .filter_map(|item| match item {
                    SelectItem::Expression {
                        alias: Some(alias), ..
                    } => Some(alias.clone()),
                    _ => None,
                })
                .collect();
        }

        if let Some(filter) = select.filter.as_mut() {
            self.resolve_expr(filter, &stack, false)?;
        }
        for expr in select.group_by.iter_mut() {
            self.resolve_expr(expr, &stack, true)?;
        }
        if let Some(having) = select.having.as_mut() {
            self.resolve_expr(having, &stack, true)?;
        }
        for order in select.order_by.iter_mut() {
            self.resolve_expr(&mut order.expr, &stack, true)?;
        }
        if let Some(limit) = select.limit.as_mut() {
            self.resolve_expr(limit, &stack, false)?;
        }
        if let Some(offset) = select.offset.as_mut() {
            self.resolve_expr(offset, &stack, false)?;
        }
        if let Some(set_op) = select.set_op.as_mut() {
            self.resolve_query(&mut set_op.right, outer)?;
        }
        Ok(output)
    }

    /// Output columns of the non-recursive arm of a recursive CTE body.
    fn anchor_columns(
        &mut self,
        query: &Query,
        outer: &[Scope<'a>],
    ) -> PipelineResult<Option<Vec<String>>> {
        match query {
            Query::Select(select) if select.set_op.is_some() => {
                let mut anchor = select.clone();
                anchor.set_op = None;
                self.resolve_select(&mut anchor, outer)
            }
            _ => Ok(None),
        }
    }

    /// Table functions also see the relations listed before them.
    fn resolve_from_item(
        &mut self,
        table: &mut TableRef,
        outer: &[Scope<'a>],
        preceding: &[Source<'a>],
    ) -> PipelineResult<Source<'a>> {
        if matches!(table, TableRef::Function { .. }) {
            let stack = push_scope(outer, preceding.to_vec());
            self.resolve_table_ref(table, &stack)
        } else {
            self.resolve_table_ref(table, outer)
        }
    }

    fn resolve_projection(
        &mut self,
        items: &mut [SelectItem],
        stack: &[Scope<'a>],
    ) -> PipelineResult<Option<Vec<String>>> {
        let mut output = Some(Vec::with_capacity(items.len()));
        for item in items.iter_mut() {
            let names = match item {
                SelectItem::Wildcard => stack.last().and_then(|scope| {
                    scope
                        .sources
                        .iter()
                        .map(Source::columns)
                        .collect::<Option<Vec<_>>>()
                        .map(|cols| cols.concat())
                }),
                SelectItem::QualifiedWildcard(qualifier) => {
                    let source = stack
                        .iter()
                        .rev()
                        .flat_map(|scope| scope.sources.iter())
                        .find(|s| s.binding().is_some_and(|b| self.name_eq(b, qualifier)))
                        .ok_or_else(|| self.mismatch(format!("{qualifier}.*")))?;
                    if let Some(binding) = source.binding() {
                        *qualifier = binding.to_string();
                    }
                    source.columns()
                }
                SelectItem::Expression { expr, alias } => {
                    self.resolve_expr(expr, stack, false)?;
                    let name = alias.clone().or_else(|| output_name(expr));
                    Some(vec![name.unwrap_or_else(|| "?column?".to_string())])
                }
            };
            output = match (output, names) {
                (Some(mut acc), Some(names)) => {
                    acc.extend(names);
                    Some(acc)
                }
                _ => None,
            };
        }
        Ok(output)
    }

    fn resolve_target(
        &mut self,
        table: &mut TableRef,
        outer: &[Scope<'a>],
    ) -> PipelineResult<(Source<'a>, &'a TableMeta)> {
        let source = self.resolve_table_ref(table, outer)?;
        match &source {
            Source::Table { table: meta, .. } => Ok((source.clone(), *meta)),
            other => Err(self.mismatch(other.binding().unwrap_or("?").to_string())),
        }
    }

    fn resolve_table_ref(
        &mut self,
        table: &mut TableRef,
        outer: &[Scope<'a>],
    ) -> PipelineResult<Source<'a>> {
        match table {
            TableRef::Table {
                schema,
                name,
                alias,
            } => {
                if safety::denied_relation(schema.as_deref(), name) {
                    let qualified = match schema {
                        Some(s) => format!("{s}.{name}"),
                        None => name.clone(),
                    };
                    return Err(self.refuse(format!(
                        "access to system relation `{qualified}` is not allowed"
                    )));
                }
                if schema.is_none() {
                    if let Some(cte) = self.ctes.iter().rev().find(|c| self.name_eq(&c.name, name)) {
                        return Ok(Source::Derived {
                            binding: alias.clone().unwrap_or_else(|| cte.name.clone()),
                            columns: cte.columns.clone(),
                        });
                    }
                }
                let meta = self
                    .lookup_table(name)
                    .ok_or_else(|| self.mismatch(name.clone()))?;
                *name = meta.name.clone();
                self.tables.insert(meta.name.clone());
                Ok(Source::Table {
                    binding: alias.clone().unwrap_or_else(|| meta.name.clone()),
                    table: meta,
                })
            }
            TableRef::Subquery { query, alias } => {
                let columns = self.resolve_query(query, outer)?;
                Ok(Source::Derived {
                    binding: alias.clone(),
                    columns,
                })
            }
            TableRef::Function {
                name,
                args,
                alias,
                columns,
            } => {
                let fixed = safety::table_function_columns(name).ok_or_else(|| {
                    self.refuse(format!("table function `{name}` is not allowed"))
                })?;
                for arg in args.iter_mut() {
                    self.resolve_expr(arg, outer, false)?;
                }
                let binding = alias.clone().unwrap_or_else(|| name.clone());
                let output = if !columns.is_empty() {
                    columns.clone()
                } else if !fixed.is_empty() {
                    fixed.iter().map(|c| c.to_string()).collect()
                } else {
                    vec![binding.clone()]
                };
                Ok(Source::Derived {
                    binding,
                    columns: Some(output),
                })
            }
        }
    }

    /// Bind `name` to a column of `table`, rewriting it to the catalog
    /// spelling. Unknown fields of inferred collections bind with a note.
    fn bind_table_column(&mut self, table: &'a TableMeta, name: &mut String) -> bool {
        let loose = table.is_inferred();
        match table.column(name, self.case_insensitive || loose) {
            Some(column) => {
                *name = column.name.clone();
                self.columns.insert(ColumnRef {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
                true
            }
            None if loose => {
                self.note(format!(
                    "field `{}` was not observed in sampled documents of `{}`",
                    name, table.name
                ));
                self.columns.insert(ColumnRef {
                    table: table.name.clone(),
                    column: name.clone(),
                });
                true
            }
            None => false,
        }
    }

    fn resolve_column(
        &mut self,
        qualifier: &mut Option<String>,
        name: &mut String,
        stack: &[Scope<'a>],
        allow_alias: bool,
        using: bool,
    ) -> PipelineResult<()> {
        if let Some(q) = qualifier.as_mut() {
            for scope in stack.iter().rev() {
                let Some(source) = scope
                    .sources
                    .iter()
                    .find(|s| s.binding().is_some_and(|b| self.name_eq(b, q)))
                else {
                    continue;
                };
                if let Some(binding) = source.binding() {
                    *q = binding.to_string();
                }
                let found = match source {
                    Source::Table { table, .. } => self.bind_table_column(*table, name),
                    Source::Derived {
                        columns: Some(columns),
                        ..
                    } => match columns.iter().find(|c| self.name_eq(c, name)) {
                        Some(column) => {
                            *name = column.clone();
                            true
                        }
                        None => false,
                    },
                    Source::Derived { columns: None, .. } => true,
                };
                return if found {
                    Ok(())
                } else {
                    Err(self.mismatch(format!("{q}.{name}")))
                };
            }

            // `customer.name` on a collection is a nested field path
            if let Some(collection) = stack.last().and_then(Scope::single_collection) {
                let mut path = format!("{q}.{name}");
                if self.bind_table_column(collection, &mut path) {
                    if let Some((head, tail)) = path.split_once('.') {
                        *q = head.to_string();
                        *name = tail.to_string();
                    }
                    return Ok(());
                }
            }
            return Err(self.mismatch(format!("{q}.{name}")));
        }

        for (depth, scope) in stack.iter().rev().enumerate() {
            let mut hits: Vec<&Source<'a>> = Vec::new();
            for source in &scope.sources {
                match source {
                    Source::Table { table, .. } => {
                        let loose = self.case_insensitive || table.is_inferred();
                        if table.column(name, loose).is_some() {
                            hits.push(source);
                        }
                    }
                    Source::Derived {
                        columns: Some(columns),
                        ..
                    } => {
                        if columns.iter().any(|c| self.name_eq(c, name)) {
                            hits.push(source);
                        }
                    }
                    Source::Derived { columns: None, .. } => {}
                }
            }

            // USING columns exist on both sides by definition
            if hits.len() > 1 && !using {
                return Err(PipelineError::Syntax {
                    message: format!("column reference `{name}` is ambiguous"),
                    statement: self.sql.to_string(),
                });
            }
            if let Some(source) = hits.first() {
                for source in if using { hits.clone() } else { vec![*source] } {
                    match source {
                        Source::Table { table, .. } => {
                            self.bind_table_column(*table, name);
                        }
                        Source::Derived {
                            columns: Some(columns),
                            ..
                        } => {
                            if let Some(column) = columns.iter().find(|c| self.name_eq(c, name)) {
                                *name = column.clone();
                            }
                        }
                        _ => {}
                    }
                }
                return Ok(());
            }
            if depth == 0
                && allow_alias
                && scope.aliases.iter().any(|a| self.name_eq(a, name))
            {
                return Ok(());
            }
        }

        if let Some(collection) = stack.last().and_then(Scope::single_collection) {
            self.bind_table_column(collection, name);
            return Ok(());
        }
        Err(self.mismatch(name.clone()))
    }

    fn resolve_expr(
        &mut self,
        expr: &mut Expression,
        stack: &[Scope<'a>],
        allow_alias: bool,
    ) -> PipelineResult<()> {
        match expr {
            Expression::Column { table, name } => {
                self.resolve_column(table, name, stack, allow_alias, false)
            }
            Expression::Function { name, args, .. } | Expression::Aggregate { name, args, .. } => {
                if safety::denied_function(name, self.denied_functions) {
                    return Err(self.refuse(format!("function `{name}` is not allowed")));
                }
                for arg in args.iter_mut() {
                    self.resolve_expr(arg, stack, allow_alias)?;
                }
                Ok(())
            }
            Expression::WindowFunction { function, window } => {
                self.resolve_expr(function, stack, allow_alias)?;
                for expr in window.partition_by.iter_mut() {
                    self.resolve_expr(expr, stack, allow_alias)?;
                }
                for order in window.order_by.iter_mut() {
                    self.resolve_expr(&mut order.expr, stack, allow_alias)?;
                }
                Ok(())
            }
            Expression::Opaque(text) => {
                Err(self.refuse(format!("unrecognized construct `{text}`")))
            }
            Expression::Subquery(query) | Expression::Exists(query) => {
                self.resolve_query(query, stack).map(|_| ())
            }
            Expression::InSubquery { expr, subquery, .. } => {
                self.resolve_expr(expr, stack, allow_alias)?;
                self.resolve_query(subquery, stack).map(|_| ())
            }
            Expression::BinaryOp { left, right, .. } => {
                self.resolve_expr(left, stack, allow_alias)?;
                self.resolve_expr(right, stack, allow_alias)
            }
            Expression::JsonAccess { expr, path, .. } => {
                self.resolve_expr(expr, stack, allow_alias)?;
                self.resolve_expr(path, stack, allow_alias)
            }
            Expression::UnaryOp { expr, .. }
            | Expression::IsNull { expr, .. }
            | Expression::Cast { expr, .. }
            | Expression::TypeCast { expr, .. }
            | Expression::Extract { expr, .. }
            | Expression::Nested(expr) => self.resolve_expr(expr, stack, allow_alias),
            Expression::Interval { value, .. } => self.resolve_expr(value, stack, allow_alias),
            Expression::Case {
                operand,
                when_clauses,
                else_clause,
            } => {
                if let Some(operand) = operand.as_mut() {
                    self.resolve_expr(operand, stack, allow_alias)?;
                }
                for (when, then) in when_clauses.iter_mut() {
                    self.resolve_expr(when, stack, allow_alias)?;
                    self.resolve_expr(then, stack, allow_alias)?;
                }
                if let Some(else_clause) = else_clause.as_mut() {
                    self.resolve_expr(else_clause, stack, allow_alias)?;
                }
                Ok(())
            }
            Expression::InList { expr, list, .. } => {
                self.resolve_expr(expr, stack, allow_alias)?;
                for item in list.iter_mut() {
                    self.resolve_expr(item, stack, allow_alias)?;
                }
                Ok(())
            }
            Expression::Between {
                expr, low, high, ..
            } => {
                self.resolve_expr(expr, stack, allow_alias)?;
                self.resolve_expr(low, stack, allow_alias)?;
                self.resolve_expr(high, stack, allow_alias)
            }
            Expression::Array(items) => {
                for item in items.iter_mut() {
                    self.resolve_expr(item, stack, allow_alias)?;
                }
                Ok(())
            }
            Expression::Literal(_)
            | Expression::TypedString { .. }
            | Expression::Wildcard
            | Expression::Parameter(_) => Ok(()),
        }
    }
}

fn push_scope<'a>(outer: &[Scope<'a>], sources: Vec<Source<'a>>) -> Vec<Scope<'a>> {
    let mut stack = outer.to_vec();
    stack.push(Scope {
        sources,
        aliases: Vec::new(),
    });
    stack
}

/// Name a backend gives an unaliased projection.
fn output_name(expr: &Expression) -> Option<String> {
    match expr.unnested() {
        Expression::Column { name, .. } => Some(name.clone()),
        Expression::Function { name, .. } | Expression::Aggregate { name, .. } => {
            Some(name.rsplit('.').next().unwrap_or(name).to_lowercase())
        }
        Expression::Cast { expr, .. } | Expression::TypeCast { expr, .. } => output_name(expr),
        _ => None,
    }
}
