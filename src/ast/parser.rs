/// SQL → statement tree parser.
///
/// Uses `sqlparser` as the frontend with the grammar of the target backend,
/// then lowers its AST into [`super::types`]. Constructs the tree does not
/// model are kept as [`Expression::Opaque`] so later stages can refuse them
/// explicitly.
use anyhow::{anyhow, Result};
use sqlparser::ast as sp;
use sqlparser::dialect::{
    Dialect as SqlDialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser as SqlParser;

use super::types::*;
use crate::dialect::Dialect;

/// Grammar used to read statements aimed at `dialect`.
pub fn grammar(dialect: Dialect) -> Box<dyn SqlDialect> {
    match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
        Dialect::MongoDb => Box::new(GenericDialect {}),
    }
}

/// Parse with the PostgreSQL grammar.
pub fn parse_sql(sql: &str) -> Result<Vec<Query>> {
    parse_sql_with(sql, Dialect::Postgres)
}

pub fn parse_sql_with(sql: &str, dialect: Dialect) -> Result<Vec<Query>> {
    let grammar = grammar(dialect);
    let statements =
        SqlParser::parse_sql(grammar.as_ref(), sql).map_err(|e| anyhow!("{}", e))?;

    statements.into_iter().map(convert_statement).collect()
}

/// Parse a single statement. Errors if the input holds more than one.
pub fn parse_single(sql: &str) -> Result<Query> {
    let mut queries = parse_sql(sql)?;
    if queries.len() != 1 {
        return Err(anyhow!("Expected 1 statement, found {}", queries.len()));
    }
    Ok(queries.remove(0))
}

fn convert_statement(stmt: sp::Statement) -> Result<Query> {
    if let Some(verb) = ddl_verb(&stmt) {
        return Ok(Query::Ddl(DdlStatement {
            verb,
            sql: stmt.to_string(),
        }));
    }
    match stmt {
        sp::Statement::Query(q) => convert_query(*q),
        sp::Statement::Insert(insert) => convert_insert(insert),
        sp::Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => convert_update(table, assignments, selection, returning),
        sp::Statement::Delete(delete) => convert_delete(delete),
        _ => Ok(Query::Raw(stmt.to_string())),
    }
}

fn ddl_verb(stmt: &sp::Statement) -> Option<DdlVerb> {
    match stmt {
        sp::Statement::CreateTable { .. }
        | sp::Statement::CreateView { .. }
        | sp::Statement::CreateIndex { .. }
        | sp::Statement::CreateSchema { .. }
        | sp::Statement::CreateDatabase { .. }
        | sp::Statement::CreateFunction { .. }
        | sp::Statement::CreateTrigger { .. }
        | sp::Statement::CreateSequence { .. }
        | sp::Statement::CreateType { .. } => Some(DdlVerb::Create),
        sp::Statement::AlterTable { .. }
        | sp::Statement::AlterIndex { .. }
        | sp::Statement::AlterView { .. } => Some(DdlVerb::Alter),
        sp::Statement::Drop { .. }
        | sp::Statement::DropFunction { .. }
        | sp::Statement::DropTrigger { .. } => Some(DdlVerb::Drop),
        sp::Statement::Truncate { .. } => Some(DdlVerb::Truncate),
        _ => None,
    }
}

fn convert_query(query: sp::Query) -> Result<Query> {
    // Row locks and FOR XML/JSON change what the statement does
    if let Some(lock) = query.locks.first() {
        return Ok(Query::Raw(lock.to_string()));
    }
    if let Some(clause) = &query.for_clause {
        return Ok(Query::Raw(clause.to_string()));
    }

    let order_by_exprs: Vec<sp::OrderByExpr> =
        query.order_by.map(|ob| ob.exprs).unwrap_or_default();

    if let Some(with) = query.with {
        let recursive = with.recursive;
        let ctes = with
            .cte_tables
            .into_iter()
            .map(convert_cte)
            .collect::<Result<Vec<_>>>()?;

        let body = convert_set_expr(*query.body)?;
        let body = apply_query_modifiers(body, &order_by_exprs, &query.limit, &query.offset)?;

        return Ok(Query::With(CTEQuery {
            recursive,
            ctes,
            body: Box::new(body),
        }));
    }

    let body = convert_set_expr(*query.body)?;
    apply_query_modifiers(body, &order_by_exprs, &query.limit, &query.offset)
}

fn apply_query_modifiers(
    query: Query,
    order_by: &[sp::OrderByExpr],
    limit: &Option<sp::Expr>,
    offset: &Option<sp::Offset>,
) -> Result<Query> {
    if let Query::Select(mut select) = query {
        if !order_by.is_empty() {
            select.order_by = order_by
                .iter()
                .map(|o| convert_order_by(o.clone()))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(l) = limit {
            select.limit = Some(convert_expr(l.clone())?);
        }
        if let Some(o) = offset {
            select.offset = Some(convert_expr(o.value.clone())?);
        }
        Ok(Query::Select(select))
    } else {
        Ok(query)
    }
}

fn convert_cte(cte: sp::Cte) -> Result<CTE> {
    Ok(CTE {
        name: cte.alias.name.value.clone(),
        columns: cte
            .alias
            .columns
            .iter()
            .map(|c| c.name.value.clone())
            .collect(),
        query: convert_query(*cte.query)?,
    })
}

fn convert_set_expr(expr: sp::SetExpr) -> Result<Query> {
    match expr {
        sp::SetExpr::Select(select) => convert_select(*select),
        sp::SetExpr::Query(query) => convert_query(*query),
        sp::SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
            ..
        } => {
            let left_query = convert_set_expr(*left)?;
            let right_query = convert_set_expr(*right)?;

            let set_op = SetOperation {
                op: match op {
                    sp::SetOperator::Union => SetOperator::Union,
                    sp::SetOperator::Intersect => SetOperator::Intersect,
                    // EXCEPT and its MINUS spelling
                    _ => SetOperator::Except,
                },
                all: matches!(
                    set_quantifier,
                    sp::SetQuantifier::All | sp::SetQuantifier::AllByName
                ),
                right: right_query,
            };

            match left_query {
                Query::Select(mut s) if s.set_op.is_none() => {
                    s.set_op = Some(Box::new(set_op));
                    Ok(Query::Select(s))
                }
                other => Ok(Query::Select(Box::new(SelectQuery {
                    projections: vec![SelectItem::Wildcard],
                    from: vec![TableRef::Subquery {
                        query: Box::new(other),
                        alias: "_left".into(),
                    }],
                    set_op: Some(Box::new(set_op)),
                    ..Default::default()
                }))),
            }
        }
        sp::SetExpr::Insert(stmt) | sp::SetExpr::Update(stmt) => convert_statement(stmt),
        _ => Ok(Query::Raw(expr.to_string())),
    }
}

fn convert_select(select: sp::Select) -> Result<Query> {
    // SELECT ... INTO creates a table
    if let Some(into) = &select.into {
        return Ok(Query::Raw(format!("SELECT INTO {}", into.name)));
    }

    let distinct = select.distinct.is_some();

    let projections = select
        .projection
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    let from = select
        .from
        .into_iter()
        .map(convert_table_with_joins)
        .collect::<Result<Vec<_>>>()?;

    // First element of each FROM item is the relation, the rest are its joins.
    let (tables, join_lists): (Vec<_>, Vec<_>) = from.into_iter().unzip();
    let joins: Vec<Join> = join_lists.into_iter().flatten().collect();

    let filter = select.selection.map(convert_expr).transpose()?;

    let group_by = match select.group_by {
        sp::GroupByExpr::Expressions(exprs, _modifiers) => exprs
            .into_iter()
            .map(convert_expr)
            .collect::<Result<Vec<_>>>()?,
        sp::GroupByExpr::All(_) => vec![],
    };

    let having = select.having.map(convert_expr).transpose()?;

    Ok(Query::Select(Box::new(SelectQuery {
        distinct,
        projections,
        from: tables,
        joins,
        filter,
        group_by,
        having,
        order_by: vec![],
        limit: None,
        offset: None,
        set_op: None,
    })))
}

fn convert_table_with_joins(twj: sp::TableWithJoins) -> Result<(TableRef, Vec<Join>)> {
    let table = convert_table_factor(twj.relation)?;
    let joins = twj
        .joins
        .into_iter()
        .map(convert_join)
        .collect::<Result<Vec<_>>>()?;
    Ok((table, joins))
}

fn convert_table_factor(tf: sp::TableFactor) -> Result<TableRef> {
    match tf {
        sp::TableFactor::Table {
            name,
            alias,
            args: Some(args),
            with_ordinality: false,
            ..
        } => {
            if args.settings.is_some() {
                return Err(anyhow!("Unsupported table function settings in `{}`", name));
            }
            table_function(name.to_string(), &args.args, alias)
        }
        sp::TableFactor::Table {
            name,
            alias,
            args: None,
            with_ordinality: false,
            ..
        } => {
            let mut parts: Vec<String> = name.0.into_iter().map(|p| p.value).collect();
            let table_name = parts.pop().unwrap_or_default();
            let schema = parts.pop();
            Ok(TableRef::Table {
                schema,
                name: table_name,
                alias: alias.map(|a| a.name.value),
            })
        }
        sp::TableFactor::Derived {
            subquery, alias, ..
        } => Ok(TableRef::Subquery {
            query: Box::new(convert_query(*subquery)?),
            alias: alias
                .map(|a| a.name.value)
                .unwrap_or_else(|| "_subquery".into()),
        }),
        sp::TableFactor::Function {
            name, args, alias, ..
        } => table_function(name.to_string(), &args, alias),
        sp::TableFactor::UNNEST {
            alias,
            array_exprs,
            with_offset: false,
            with_offset_alias: None,
            with_ordinality: false,
        } => Ok(TableRef::Function {
            name: "unnest".into(),
            args: array_exprs
                .into_iter()
                .map(convert_expr)
                .collect::<Result<Vec<_>>>()?,
            columns: alias_columns(alias.as_ref()),
            alias: alias.map(|a| a.name.value),
        }),
        other => Err(anyhow!("Unsupported FROM item: {}", other)),
    }
}

fn table_function(
    name: String,
    args: &[sp::FunctionArg],
    alias: Option<sp::TableAlias>,
) -> Result<TableRef> {
    let args = args
        .iter()
        .map(|arg| match arg {
            sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => convert_expr(e.clone()),
            other => Err(anyhow!("Unsupported argument `{}` to {}", other, name)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TableRef::Function {
        name,
        args,
        columns: alias_columns(alias.as_ref()),
        alias: alias.map(|a| a.name.value),
    })
}

fn alias_columns(alias: Option<&sp::TableAlias>) -> Vec<String> {
    alias
        .map(|a| a.columns.iter().map(|c| c.name.value.clone()).collect())
        .unwrap_or_default()
}

fn convert_join(join: sp::Join) -> Result<Join> {
    let (join_type, constraint) = match &join.join_operator {
        sp::JoinOperator::Inner(c) => (JoinType::Inner, Some(c)),
        sp::JoinOperator::LeftOuter(c) => (JoinType::Left, Some(c)),
        sp::JoinOperator::RightOuter(c) => (JoinType::Right, Some(c)),
        sp::JoinOperator::FullOuter(c) => (JoinType::Full, Some(c)),
        sp::JoinOperator::CrossJoin => (JoinType::Cross, None),
        other => {
            return Err(anyhow!("Unsupported join operator: {:?}", other));
        }
    };

    let condition = match constraint {
        Some(c) => convert_join_constraint(c)?,
        None => None,
    };

    Ok(Join {
        join_type,
        table: convert_table_factor(join.relation)?,
        condition,
    })
}

fn convert_join_constraint(constraint: &sp::JoinConstraint) -> Result<Option<JoinCondition>> {
    match constraint {
        sp::JoinConstraint::On(expr) => Ok(Some(JoinCondition::On(convert_expr(expr.clone())?))),
        sp::JoinConstraint::Using(cols) => Ok(Some(JoinCondition::Using(
            cols.iter().map(|c| c.value.clone()).collect(),
        ))),
        sp::JoinConstraint::Natural => Ok(Some(JoinCondition::Natural)),
        sp::JoinConstraint::None => Ok(None),
    }
}

fn convert_select_item(item: sp::SelectItem) -> Result<SelectItem> {
    match item {
        sp::SelectItem::UnnamedExpr(expr) => Ok(SelectItem::Expression {
            expr: convert_expr(expr)?,
            alias: None,
        }),
        sp::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expression {
            expr: convert_expr(expr)?,
            alias: Some(alias.value),
        }),
        sp::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
        sp::SelectItem::QualifiedWildcard(name, _) => Ok(SelectItem::QualifiedWildcard(
            name.0.last().map(|i| i.value.clone()).unwrap_or_default(),
        )),
    }
}

fn convert_expr(expr: sp::Expr) -> Result<Expression> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(Expression::Column {
            table: None,
            name: ident.value,
        }),
        sp::Expr::CompoundIdentifier(parts) => {
            let mut names: Vec<String> = parts.into_iter().map(|p| p.value).collect();
            let name = names.pop().unwrap_or_default();
            // schema.table.column keeps only the table qualifier
            let table = names.pop();
            Ok(Expression::Column { table, name })
        }
        sp::Expr::Value(val) => Ok(convert_value(val)),
        sp::Expr::BinaryOp {
            left,
            op: op @ (sp::BinaryOperator::Arrow | sp::BinaryOperator::LongArrow),
            right,
        } => Ok(Expression::JsonAccess {
            expr: Box::new(convert_expr(*left)?),
            path: Box::new(convert_expr(*right)?),
            as_text: matches!(op, sp::BinaryOperator::LongArrow),
        }),
        sp::Expr::BinaryOp { left, op, right } => match convert_binary_op(&op) {
            Some(bin) => Ok(Expression::BinaryOp {
                left: Box::new(convert_expr(*left)?),
                op: bin,
                right: Box::new(convert_expr(*right)?),
            }),
            None => Ok(Expression::Opaque(
                sp::Expr::BinaryOp { left, op, right }.to_string(),
            )),
        },
        sp::Expr::UnaryOp { op, expr } => match convert_unary_op(&op) {
            Some(un) => Ok(Expression::UnaryOp {
                op: un,
                expr: Box::new(convert_expr(*expr)?),
            }),
            None => Ok(Expression::Opaque(sp::Expr::UnaryOp { op, expr }.to_string())),
        },
        sp::Expr::Function(func) => convert_function(func),
        sp::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let when_clauses = conditions
                .into_iter()
                .zip(results)
                .map(|(c, r)| Ok((convert_expr(c)?, convert_expr(r)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expression::Case {
                operand: operand.map(|o| convert_expr(*o)).transpose()?.map(Box::new),
                when_clauses,
                else_clause: else_result
                    .map(|e| convert_expr(*e))
                    .transpose()?
                    .map(Box::new),
            })
        }
        sp::Expr::Subquery(q) => Ok(Expression::Subquery(Box::new(convert_query(*q)?))),
        sp::Expr::Exists { subquery, negated } => {
            let exists = Expression::Exists(Box::new(convert_query(*subquery)?));
            if negated {
                Ok(Expression::UnaryOp {
                    op: UnaryOperator::Not,
                    expr: Box::new(exists),
                })
            } else {
                Ok(exists)
            }
        }
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expression::InList {
            expr: Box::new(convert_expr(*expr)?),
            list: list
                .into_iter()
                .map(convert_expr)
                .collect::<Result<Vec<_>>>()?,
            negated,
        }),
        sp::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => Ok(Expression::InSubquery {
            expr: Box::new(convert_expr(*expr)?),
            subquery: Box::new(convert_query(*subquery)?),
            negated,
        }),
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expression::Between {
            expr: Box::new(convert_expr(*expr)?),
            low: Box::new(convert_expr(*low)?),
            high: Box::new(convert_expr(*high)?),
            negated,
        }),
        sp::Expr::IsNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: false,
        }),
        sp::Expr::IsNotNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: true,
        }),
        sp::Expr::Cast {
            kind,
            expr,
            data_type,
            ..
        } => {
            let expr = Box::new(convert_expr(*expr)?);
            let data_type = data_type.to_string();
            if matches!(kind, sp::CastKind::DoubleColon) {
                Ok(Expression::TypeCast { expr, data_type })
            } else {
                Ok(Expression::Cast { expr, data_type })
            }
        }
        sp::Expr::Extract { field, expr, .. } => Ok(Expression::Extract {
            field: field.to_string().to_uppercase(),
            expr: Box::new(convert_expr(*expr)?),
        }),
        sp::Expr::Interval(interval) => Ok(Expression::Interval {
            value: Box::new(convert_expr(*interval.value)?),
            unit: interval.leading_field.map(|f| f.to_string().to_uppercase()),
        }),
        sp::Expr::TypedString {
            data_type, value, ..
        } => Ok(Expression::TypedString {
            data_type: data_type.to_string().to_uppercase(),
            value: value.to_string().trim_matches('\'').to_string(),
        }),
        sp::Expr::Nested(expr) => Ok(Expression::Nested(Box::new(convert_expr(*expr)?))),
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => Ok(Expression::BinaryOp {
            left: Box::new(convert_expr(*expr)?),
            op: if negated {
                BinaryOperator::NotLike
            } else {
                BinaryOperator::Like
            },
            right: Box::new(convert_expr(*pattern)?),
        }),
        sp::Expr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => Ok(Expression::BinaryOp {
            left: Box::new(convert_expr(*expr)?),
            op: if negated {
                BinaryOperator::NotILike
            } else {
                BinaryOperator::ILike
            },
            right: Box::new(convert_expr(*pattern)?),
        }),
        sp::Expr::Array(arr) => Ok(Expression::Array(
            arr.elem
                .into_iter()
                .map(convert_expr)
                .collect::<Result<Vec<_>>>()?,
        )),
        sp::Expr::JsonAccess { value, path } => convert_json_access(*value, path),
        other => Ok(Expression::Opaque(other.to_string())),
    }
}

fn convert_json_access(value: sp::Expr, path: sp::JsonPath) -> Result<Expression> {
    let mut current = convert_expr(value)?;

    for element in path.path {
        let key = match element {
            sp::JsonPathElem::Dot { key, .. } => Expression::Literal(Literal::String(key)),
            sp::JsonPathElem::Bracket { key } => convert_expr(key)?,
        };
        current = Expression::JsonAccess {
            expr: Box::new(current),
            path: Box::new(key),
            as_text: false,
        };
    }

    Ok(current)
}

fn convert_value(val: sp::Value) -> Expression {
    match val {
        sp::Value::Null => Expression::Literal(Literal::Null),
        sp::Value::Boolean(b) => Expression::Literal(Literal::Boolean(b)),
        sp::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Expression::Literal(Literal::Integer(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Expression::Literal(Literal::Float(f))
            } else {
                Expression::Literal(Literal::String(n))
            }
        }
        sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => {
            Expression::Literal(Literal::String(s))
        }
        sp::Value::Placeholder(p) => match p.strip_prefix('$').and_then(|n| n.parse().ok()) {
            Some(idx) => Expression::Parameter(idx),
            None => Expression::Opaque(p),
        },
        other => Expression::Opaque(other.to_string()),
    }
}

fn convert_binary_op(op: &sp::BinaryOperator) -> Option<BinaryOperator> {
    Some(match op {
        sp::BinaryOperator::Eq => BinaryOperator::Eq,
        sp::BinaryOperator::NotEq => BinaryOperator::NotEq,
        sp::BinaryOperator::Lt => BinaryOperator::Lt,
        sp::BinaryOperator::LtEq => BinaryOperator::LtEq,
        sp::BinaryOperator::Gt => BinaryOperator::Gt,
        sp::BinaryOperator::GtEq => BinaryOperator::GtEq,
        sp::BinaryOperator::And => BinaryOperator::And,
        sp::BinaryOperator::Or => BinaryOperator::Or,
        sp::BinaryOperator::Plus => BinaryOperator::Plus,
        sp::BinaryOperator::Minus => BinaryOperator::Minus,
        sp::BinaryOperator::Multiply => BinaryOperator::Multiply,
        sp::BinaryOperator::Divide => BinaryOperator::Divide,
        sp::BinaryOperator::Modulo => BinaryOperator::Modulo,
        sp::BinaryOperator::StringConcat => BinaryOperator::Concat,
        _ => return None,
    })
}

fn convert_unary_op(op: &sp::UnaryOperator) -> Option<UnaryOperator> {
    match op {
        sp::UnaryOperator::Not => Some(UnaryOperator::Not),
        sp::UnaryOperator::Minus => Some(UnaryOperator::Minus),
        sp::UnaryOperator::Plus => Some(UnaryOperator::Plus),
        _ => None,
    }
}

const AGGREGATES: &[&str] = &[
    "COUNT",
    "SUM",
    "AVG",
    "MIN",
    "MAX",
    "ARRAY_AGG",
    "STRING_AGG",
    "GROUP_CONCAT",
    "BOOL_AND",
    "BOOL_OR",
];

fn convert_function(func: sp::Function) -> Result<Expression> {
    let name = func.name.to_string().to_uppercase();

    if func.filter.is_some() || !func.within_group.is_empty() {
        return Ok(Expression::Opaque(func.to_string()));
    }

    let (args, distinct) = match &func.args {
        sp::FunctionArguments::List(arg_list) => {
            let distinct = matches!(
                arg_list.duplicate_treatment,
                Some(sp::DuplicateTreatment::Distinct)
            );
            let mut args = Vec::with_capacity(arg_list.args.len());
            for arg in &arg_list.args {
                match arg {
                    sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e))
                    | sp::FunctionArg::Named {
                        arg: sp::FunctionArgExpr::Expr(e),
                        ..
                    } => args.push(convert_expr(e.clone())?),
                    sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => {
                        args.push(Expression::Wildcard)
                    }
                    _ => return Ok(Expression::Opaque(func.to_string())),
                }
            }
            (args, distinct)
        }
        sp::FunctionArguments::None => (vec![], false),
        sp::FunctionArguments::Subquery(q) => (
            vec![Expression::Subquery(Box::new(convert_query(*q.clone())?))],
            false,
        ),
    };

    if let Some(over) = &func.over {
        let window = match over {
            sp::WindowType::WindowSpec(spec) => convert_window_spec(spec.clone())?,
            // WINDOW clauses are not modeled
            sp::WindowType::NamedWindow(_) => return Ok(Expression::Opaque(func.to_string())),
        };
        return Ok(Expression::WindowFunction {
            function: Box::new(Expression::Function {
                name,
                args,
                distinct,
            }),
            window,
        });
    }

    if AGGREGATES.contains(&name.as_str()) {
        Ok(Expression::Aggregate {
            name,
            args,
            distinct,
        })
    } else {
        Ok(Expression::Function {
            name,
            args,
            distinct,
        })
    }
}

fn convert_window_spec(spec: sp::WindowSpec) -> Result<WindowSpec> {
    Ok(WindowSpec {
        partition_by: spec
            .partition_by
            .into_iter()
            .map(convert_expr)
            .collect::<Result<Vec<_>>>()?,
        order_by: spec
            .order_by
            .into_iter()
            .map(convert_order_by)
            .collect::<Result<Vec<_>>>()?,
        frame: match &spec.window_frame {
            Some(frame) => Some(
                convert_window_frame(frame)
                    .ok_or_else(|| anyhow!("Unsupported window frame bound"))?,
            ),
            None => None,
        },
    })
}

/// Frame clause as text. Only literal offsets are accepted as bounds.
fn convert_window_frame(frame: &sp::WindowFrame) -> Option<String> {
    let literal = |bound: &sp::WindowFrameBound| match bound {
        sp::WindowFrameBound::CurrentRow
        | sp::WindowFrameBound::Preceding(None)
        | sp::WindowFrameBound::Following(None) => true,
        sp::WindowFrameBound::Preceding(Some(expr))
        | sp::WindowFrameBound::Following(Some(expr)) => {
            matches!(**expr, sp::Expr::Value(sp::Value::Number(..)))
        }
    };
    if !literal(&frame.start_bound) || frame.end_bound.as_ref().is_some_and(|b| !literal(b)) {
        return None;
    }
    Some(match &frame.end_bound {
        Some(end) => format!("{} BETWEEN {} AND {}", frame.units, frame.start_bound, end),
        None => format!("{} {}", frame.units, frame.start_bound),
    })
}

fn convert_order_by(order: sp::OrderByExpr) -> Result<OrderByExpr> {
    Ok(OrderByExpr {
        expr: convert_expr(order.expr)?,
        asc: order.asc,
        nulls_first: order.nulls_first,
    })
}

fn convert_insert(insert: sp::Insert) -> Result<Query> {
    let mut parts: Vec<String> = insert.table_name.0.into_iter().map(|p| p.value).collect();
    let table = TableRef::Table {
        name: parts.pop().unwrap_or_default(),
        schema: parts.pop(),
        alias: None,
    };

    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let source = match insert.source {
        Some(src) => match *src.body {
            sp::SetExpr::Values(values) => InsertSource::Values(
                values
                    .rows
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(convert_expr)
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => InsertSource::Query(Box::new(convert_query(*src)?)),
        },
        None => InsertSource::Values(vec![]),
    };

    let returning = insert
        .returning
        .unwrap_or_default()
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    Ok(Query::Insert(InsertQuery {
        table,
        columns,
        source,
        returning,
    }))
}

fn convert_update(
    table: sp::TableWithJoins,
    assignments: Vec<sp::Assignment>,
    selection: Option<sp::Expr>,
    returning: Option<Vec<sp::SelectItem>>,
) -> Result<Query> {
    let table_ref = convert_table_factor(table.relation)?;

    let assigns = assignments
        .into_iter()
        .map(|a| {
            Ok(Assignment {
                column: a.target.to_string(),
                value: convert_expr(a.value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Query::Update(UpdateQuery {
        table: table_ref,
        assignments: assigns,
        filter: selection.map(convert_expr).transpose()?,
        returning: returning
            .unwrap_or_default()
            .into_iter()
            .map(convert_select_item)
            .collect::<Result<Vec<_>>>()?,
    }))
}

fn convert_delete(delete: sp::Delete) -> Result<Query> {
    let from_tables = match delete.from {
        sp::FromTable::WithFromKeyword(tables) | sp::FromTable::WithoutKeyword(tables) => tables,
    };

    let table_ref = match from_tables.into_iter().next() {
        Some(twj) => convert_table_factor(twj.relation)?,
        None => return Err(anyhow!("DELETE without table reference")),
    };

    Ok(Query::Delete(DeleteQuery {
        table: table_ref,
        filter: delete.selection.map(convert_expr).transpose()?,
        returning: delete
            .returning
            .unwrap_or_default()
            .into_iter()
            .map(convert_select_item)
            .collect::<Result<Vec<_>>>()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(sql: &str) -> SelectQuery {
        match parse_single(sql).unwrap() {
            Query::Select(s) => *s,
            other => panic!("Expected Select query, got {:?}", other),
        }
    }

    fn first_projection(s: &SelectQuery) -> &Expression {
        match &s.projections[0] {
            SelectItem::Expression { expr, .. } => expr,
            other => panic!("Expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_select() {
        let s = select("SELECT * FROM users");
        assert!(matches!(s.projections[0], SelectItem::Wildcard));
        assert_eq!(s.from.len(), 1);
    }

    #[test]
    fn test_parse_schema_qualified_table() {
        let s = select("SELECT * FROM public.users u");
        assert_eq!(
            s.from[0],
            TableRef::Table {
                schema: Some("public".into()),
                name: "users".into(),
                alias: Some("u".into()),
            }
        );
    }

    #[test]
    fn test_parse_select_with_join() {
        let s = select("SELECT u.name, o.total FROM users u JOIN orders o ON u.id = o.user_id");
        assert_eq!(s.joins.len(), 1);
        assert_eq!(s.joins[0].join_type, JoinType::Inner);
        assert_eq!(
            first_projection(&s),
            &Expression::column(Some("u"), "name")
        );
    }

    #[test]
    fn test_parse_group_by_having() {
        let s = select(
            "SELECT department, COUNT(*) FROM employees GROUP BY department HAVING COUNT(*) > 5",
        );
        assert_eq!(s.group_by.len(), 1);
        assert!(s.having.is_some());
    }

    #[test]
    fn test_parse_cte() {
        match parse_single(
            "WITH active AS (SELECT * FROM users WHERE active = true) SELECT * FROM active",
        )
        .unwrap()
        {
            Query::With(cte) => {
                assert!(!cte.recursive);
                assert_eq!(cte.ctes[0].name, "active");
            }
            other => panic!("Expected CTE query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_window_function() {
        let s = select(
            "SELECT ROW_NUMBER() OVER (PARTITION BY dept ORDER BY salary DESC) FROM employees",
        );
        assert!(matches!(
            first_projection(&s),
            Expression::WindowFunction { .. }
        ));
    }

    #[test]
    fn test_parse_insert_update_delete() {
        assert!(matches!(
            parse_single("INSERT INTO users (name) VALUES ('John')").unwrap(),
            Query::Insert(_)
        ));
        match parse_single("UPDATE users SET name = 'Jane' WHERE id = 1").unwrap() {
            Query::Update(u) => assert_eq!(u.assignments[0].column, "name"),
            other => panic!("Expected Update, got {:?}", other),
        }
        assert!(matches!(
            parse_single("DELETE FROM users WHERE id = 1").unwrap(),
            Query::Delete(_)
        ));
    }

    #[test]
    fn test_parse_ddl_classified() {
        match parse_single("DROP TABLE users").unwrap() {
            Query::Ddl(ddl) => assert_eq!(ddl.verb, DdlVerb::Drop),
            other => panic!("Expected DDL, got {:?}", other),
        }
        match parse_single("CREATE TABLE t (id INT)").unwrap() {
            Query::Ddl(ddl) => assert_eq!(ddl.verb, DdlVerb::Create),
            other => panic!("Expected DDL, got {:?}", other),
        }
        assert!(matches!(
            parse_single("TRUNCATE TABLE users").unwrap(),
            Query::Ddl(DdlStatement {
                verb: DdlVerb::Truncate,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_admin_statement_is_raw() {
        assert!(matches!(
            parse_single("SET search_path TO public").unwrap(),
            Query::Raw(_)
        ));
    }

    #[test]
    fn test_parse_in_subquery() {
        let s = select("SELECT * FROM users WHERE id IN (SELECT user_id FROM active_users)");
        assert!(matches!(
            s.filter,
            Some(Expression::InSubquery { negated: false, .. })
        ));
    }

    #[test]
    fn test_parse_multiple_statements() {
        assert_eq!(parse_sql("SELECT 1; SELECT 2").unwrap().len(), 2);
    }

    #[test]
    fn test_parse_invalid_sql() {
        assert!(parse_single("SELCT * FORM users").is_err());
    }

    #[test]
    fn test_parse_union() {
        let s = select("SELECT id FROM users UNION ALL SELECT id FROM admins");
        let set_op = s.set_op.unwrap();
        assert_eq!(set_op.op, SetOperator::Union);
        assert!(set_op.all);
    }

    #[test]
    fn test_parse_order_by_limit() {
        let s = select("SELECT * FROM users ORDER BY name ASC LIMIT 10 OFFSET 5");
        assert_eq!(s.order_by[0].asc, Some(true));
        assert_eq!(s.limit, Some(Expression::Literal(Literal::Integer(10))));
        assert_eq!(s.offset, Some(Expression::Literal(Literal::Integer(5))));
    }

    #[test]
    fn test_parse_cast_forms() {
        let s = select("SELECT CAST(price AS INTEGER), price::TEXT FROM products");
        assert!(matches!(first_projection(&s), Expression::Cast { .. }));
        match &s.projections[1] {
            SelectItem::Expression { expr, .. } => {
                assert!(matches!(expr, Expression::TypeCast { .. }))
            }
            other => panic!("Expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_extract_and_interval() {
        let s = select(
            "SELECT EXTRACT(YEAR FROM created_at) FROM orders WHERE created_at > NOW() - INTERVAL '7 days'",
        );
        match first_projection(&s) {
            Expression::Extract { field, .. } => assert_eq!(field, "YEAR"),
            other => panic!("Expected extract, got {:?}", other),
        }
        let mut saw_interval = false;
        s.filter.as_ref().unwrap().walk(&mut |e| {
            if matches!(e, Expression::Interval { .. }) {
                saw_interval = true;
            }
        });
        assert!(saw_interval);
    }

    #[test]
    fn test_parse_aggregate_distinct() {
        let s = select("SELECT COUNT(DISTINCT status) FROM orders");
        match first_projection(&s) {
            Expression::Aggregate { distinct, name, .. } => {
                assert!(distinct);
                assert_eq!(name, "COUNT");
            }
            other => panic!("Expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_window_frame() {
        let s = select(
            "SELECT SUM(amount) OVER (ORDER BY id ROWS BETWEEN 2 PRECEDING AND CURRENT ROW) FROM orders",
        );
        match first_projection(&s) {
            Expression::WindowFunction { window, .. } => assert_eq!(
                window.frame.as_deref(),
                Some("ROWS BETWEEN 2 PRECEDING AND CURRENT ROW")
            ),
            other => panic!("Expected window function, got {:?}", other),
        }
        assert!(parse_single(
            "SELECT SUM(amount) OVER (ORDER BY id ROWS BETWEEN amount PRECEDING AND CURRENT ROW) FROM orders"
        )
        .is_err());
    }

    #[test]
    fn test_parse_table_functions() {
        let s = select("SELECT n FROM generate_series(1, 3) AS g(n)");
        assert_eq!(
            s.from[0],
            TableRef::Function {
                name: "generate_series".into(),
                args: vec![
                    Expression::Literal(Literal::Integer(1)),
                    Expression::Literal(Literal::Integer(3)),
                ],
                alias: Some("g".into()),
                columns: vec!["n".into()],
            }
        );
        let s = select("SELECT * FROM UNNEST(ARRAY[1, 2]) AS u");
        assert!(matches!(
            &s.from[0],
            TableRef::Function { name, args, .. } if name == "unnest" && args.len() == 1
        ));
        assert!(
            parse_single("SELECT * FROM generate_series(1, 3) WITH ORDINALITY AS g(n, i)").is_err()
        );
    }

    #[test]
    fn test_select_into_and_locks_are_raw() {
        assert!(matches!(
            parse_single("SELECT * INTO archive FROM orders").unwrap(),
            Query::Raw(text) if text == "SELECT INTO archive"
        ));
        assert!(matches!(
            parse_single("SELECT id FROM orders FOR UPDATE").unwrap(),
            Query::Raw(text) if text.starts_with("FOR UPDATE")
        ));
    }

    #[test]
    fn test_unmodeled_construct_is_opaque() {
        let s = select("SELECT tags @> ARRAY['a'] FROM posts");
        assert!(matches!(first_projection(&s), Expression::Opaque(_)));
    }

    #[test]
    fn test_mysql_grammar_accepts_backticks() {
        let queries = parse_sql_with("SELECT `name` FROM `users`", Dialect::MySql).unwrap();
        match &queries[0] {
            Query::Select(s) => assert_eq!(s.from[0].table_name(), Some("users")),
            other => panic!("Expected Select, got {:?}", other),
        }
    }
}
