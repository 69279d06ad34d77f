/// Statement tree → SQL text.
///
/// Rendering is driven by a [`DialectRules`] table: identifier quoting,
/// function spellings and the constructs a backend cannot express. A
/// construct the target lacks fails with `UnsupportedConstruct` instead of
/// producing SQL the backend would reject at execution time.
use super::types::*;
use crate::dialect::{Dialect, DialectRules};
use crate::error::PipelineResult;

/// Compile for PostgreSQL.
pub fn compile(query: &Query) -> PipelineResult<String> {
    compile_for(query, Dialect::Postgres.rules())
}

pub fn compile_for(query: &Query, rules: &DialectRules) -> PipelineResult<String> {
    SqlCompiler { rules }.query(query)
}

/// Render a single expression, e.g. for messages that quote a predicate.
pub fn compile_expr(expr: &Expression, rules: &DialectRules) -> PipelineResult<String> {
    SqlCompiler { rules }.expr(expr)
}

struct SqlCompiler<'a> {
    rules: &'a DialectRules,
}

impl SqlCompiler<'_> {
    fn query(&self, query: &Query) -> PipelineResult<String> {
        match query {
            Query::Select(s) => self.select(s),
            Query::Insert(i) => self.insert(i),
            Query::Update(u) => self.update(u),
            Query::Delete(d) => self.delete(d),
            Query::With(cte) => self.cte(cte),
            Query::Ddl(ddl) => Ok(ddl.sql.clone()),
            Query::Raw(sql) => Ok(sql.clone()),
        }
    }

    fn ident(&self, name: &str) -> String {
        self.rules.quote_ident(name)
    }

    fn list<T>(
        &self,
        items: &[T],
        render: impl Fn(&T) -> PipelineResult<String>,
    ) -> PipelineResult<String> {
        Ok(items
            .iter()
            .map(render)
            .collect::<PipelineResult<Vec<_>>>()?
            .join(", "))
    }

    fn select(&self, select: &SelectQuery) -> PipelineResult<String> {
        let mut parts = Vec::new();

        let mut select_clause = String::from("SELECT ");
        if select.distinct {
            select_clause.push_str("DISTINCT ");
        }
        if select.projections.is_empty() {
            select_clause.push('*');
        } else {
            select_clause.push_str(&self.list(&select.projections, |p| self.select_item(p))?);
        }
        parts.push(select_clause);

        if !select.from.is_empty() {
            parts.push(format!(
                "FROM {}",
                self.list(&select.from, |t| self.table_ref(t))?
            ));
        }

        for join in &select.joins {
            parts.push(self.join(join)?);
        }

        if let Some(ref filter) = select.filter {
            parts.push(format!("WHERE {}", self.expr(filter)?));
        }

        if !select.group_by.is_empty() {
            parts.push(format!(
                "GROUP BY {}",
                self.list(&select.group_by, |e| self.expr(e))?
            ));
        }

        if let Some(ref having) = select.having {
            parts.push(format!("HAVING {}", self.expr(having)?));
        }

        if let Some(ref set_op) = select.set_op {
            let op_str = match set_op.op {
                SetOperator::Union => "UNION",
                SetOperator::Intersect => "INTERSECT",
                SetOperator::Except => "EXCEPT",
            };
            let all_str = if set_op.all { " ALL" } else { "" };
            parts.push(format!("{}{} {}", op_str, all_str, self.query(&set_op.right)?));
        }

        if !select.order_by.is_empty() {
            parts.push(format!(
                "ORDER BY {}",
                self.list(&select.order_by, |o| self.order_by(o))?
            ));
        }

        if let Some(ref limit) = select.limit {
            parts.push(format!("LIMIT {}", self.expr(limit)?));
        }

        if let Some(ref offset) = select.offset {
            // MySQL and SQLite only accept OFFSET after a LIMIT
            if select.limit.is_none() {
                match self.rules.dialect {
                    Dialect::MySql => parts.push("LIMIT 18446744073709551615".to_string()),
                    Dialect::Sqlite => parts.push("LIMIT -1".to_string()),
                    _ => {}
                }
            }
            parts.push(format!("OFFSET {}", self.expr(offset)?));
        }

        Ok(parts.join(" "))
    }

    fn select_item(&self, item: &SelectItem) -> PipelineResult<String> {
        Ok(match item {
            SelectItem::Wildcard => "*".to_string(),
            SelectItem::QualifiedWildcard(table) => format!("{}.*", self.ident(table)),
            SelectItem::Expression { expr, alias } => {
                let expr_str = self.expr(expr)?;
                match alias {
                    Some(a) => format!("{} AS {}", expr_str, self.ident(a)),
                    None => expr_str,
                }
            }
        })
    }

    fn table_ref(&self, table: &TableRef) -> PipelineResult<String> {
        Ok(match table {
            TableRef::Table {
                schema,
                name,
                alias,
            } => {
                let mut s = match schema {
                    Some(sc) => format!("{}.{}", self.ident(sc), self.ident(name)),
                    None => self.ident(name),
                };
                if let Some(a) = alias {
                    s.push_str(&format!(" AS {}", self.ident(a)));
                }
                s
            }
            TableRef::Subquery { query, alias } => {
                format!("({}) AS {}", self.query(query)?, self.ident(alias))
            }
            TableRef::Function {
                name,
                args,
                alias,
                columns,
            } => {
                let mut s = format!("{}({})", name, self.list(args, |a| self.expr(a))?);
                if let Some(a) = alias {
                    s.push_str(&format!(" AS {}", self.ident(a)));
                    if !columns.is_empty() {
                        s.push_str(&format!(
                            "({})",
                            self.list(columns, |c| Ok(self.ident(c)))?
                        ));
                    }
                }
                s
            }
        })
    }

    fn join(&self, join: &Join) -> PipelineResult<String> {
        let type_str = match join.join_type {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => {
                self.rules.require(self.rules.full_join, "FULL JOIN")?;
                "FULL JOIN"
            }
            JoinType::Cross => "CROSS JOIN",
        };

        let table_str = self.table_ref(&join.table)?;

        Ok(match &join.condition {
            Some(JoinCondition::On(expr)) => {
                format!("{} {} ON {}", type_str, table_str, self.expr(expr)?)
            }
            Some(JoinCondition::Using(cols)) => format!(
                "{} {} USING ({})",
                type_str,
                table_str,
                self.list(cols, |c| Ok(self.ident(c)))?
            ),
            Some(JoinCondition::Natural) => format!("NATURAL {} {}", type_str, table_str),
            None => format!("{} {}", type_str, table_str),
        })
    }

    fn expr(&self, expr: &Expression) -> PipelineResult<String> {
        let rules = self.rules;
        Ok(match expr {
            Expression::Column { table, name } => match table {
                Some(t) => format!("{}.{}", self.ident(t), self.ident(name)),
                None => self.ident(name),
            },
            Expression::Literal(lit) => compile_literal(lit),
            Expression::BinaryOp { left, op, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                let op_str = match op {
                    BinaryOperator::Eq => "=",
                    BinaryOperator::NotEq => "<>",
                    BinaryOperator::Lt => "<",
                    BinaryOperator::LtEq => "<=",
                    BinaryOperator::Gt => ">",
                    BinaryOperator::GtEq => ">=",
                    BinaryOperator::And => "AND",
                    BinaryOperator::Or => "OR",
                    BinaryOperator::Plus => "+",
                    BinaryOperator::Minus => "-",
                    BinaryOperator::Multiply => "*",
                    BinaryOperator::Divide => "/",
                    BinaryOperator::Modulo => "%",
                    BinaryOperator::Like => "LIKE",
                    BinaryOperator::NotLike => "NOT LIKE",
                    BinaryOperator::ILike if rules.ilike => "ILIKE",
                    BinaryOperator::NotILike if rules.ilike => "NOT ILIKE",
                    // LIKE is case-insensitive under the default collations
                    BinaryOperator::ILike => "LIKE",
                    BinaryOperator::NotILike => "NOT LIKE",
                    BinaryOperator::Concat if !rules.concat_operator => {
                        return Ok(format!("CONCAT({}, {})", l, r));
                    }
                    BinaryOperator::Concat => "||",
                };
                format!("{} {} {}", l, op_str, r)
            }
            Expression::UnaryOp { op, expr } => {
                let op_str = match op {
                    UnaryOperator::Not => "NOT ",
                    UnaryOperator::Minus => "-",
                    UnaryOperator::Plus => "+",
                };
                format!("{}{}", op_str, self.expr(expr)?)
            }
            Expression::Function {
                name,
                args,
                distinct,
            }
            | Expression::Aggregate {
                name,
                args,
                distinct,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<PipelineResult<Vec<_>>>()?;
                rules.function_call(name, &args, *distinct)?
            }
            Expression::WindowFunction { function, window } => {
                rules.require(rules.window_functions, "window functions")?;
                format!(
                    "{} OVER ({})",
                    self.expr(function)?,
                    self.window_spec(window)?
                )
            }
            Expression::Case {
                operand,
                when_clauses,
                else_clause,
            } => {
                let mut s = String::from("CASE");
                if let Some(op) = operand {
                    s.push_str(&format!(" {}", self.expr(op)?));
                }
                for (when, then) in when_clauses {
                    s.push_str(&format!(
                        " WHEN {} THEN {}",
                        self.expr(when)?,
                        self.expr(then)?
                    ));
                }
                if let Some(else_expr) = else_clause {
                    s.push_str(&format!(" ELSE {}", self.expr(else_expr)?));
                }
                s.push_str(" END");
                s
            }
            Expression::Subquery(q) => format!("({})", self.query(q)?),
            Expression::Exists(q) => format!("EXISTS ({})", self.query(q)?),
            Expression::InList {
                expr,
                list,
                negated,
            } => format!(
                "{} {}IN ({})",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.list(list, |e| self.expr(e))?
            ),
            Expression::InSubquery {
                expr,
                subquery,
                negated,
            } => format!(
                "{} {}IN ({})",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.query(subquery)?
            ),
            Expression::Between {
                expr,
                low,
                high,
                negated,
            } => format!(
                "{} {}BETWEEN {} AND {}",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.expr(low)?,
                self.expr(high)?
            ),
            Expression::IsNull { expr, negated } => {
                if *negated {
                    format!("{} IS NOT NULL", self.expr(expr)?)
                } else {
                    format!("{} IS NULL", self.expr(expr)?)
                }
            }
            Expression::Cast { expr, data_type } => {
                format!("CAST({} AS {})", self.expr(expr)?, rules.cast_type(data_type))
            }
            Expression::TypeCast { expr, data_type } if rules.type_cast_operator => {
                format!("{}::{}", self.expr(expr)?, data_type)
            }
            Expression::TypeCast { expr, data_type } => {
                format!("CAST({} AS {})", self.expr(expr)?, rules.cast_type(data_type))
            }
            Expression::Extract { field, expr } => rules.extract(field, &self.expr(expr)?)?,
            Expression::Interval { value, unit } => {
                let raw = match value.unnested() {
                    Expression::Literal(Literal::String(s)) => s.clone(),
                    Expression::Literal(Literal::Integer(n)) => n.to_string(),
                    other => self.expr(other)?,
                };
                rules.interval(&raw, unit.as_deref())?
            }
            Expression::TypedString { data_type, value } => match rules.dialect {
                Dialect::Sqlite => compile_literal(&Literal::String(value.clone())),
                _ => format!(
                    "{} {}",
                    data_type,
                    compile_literal(&Literal::String(value.clone()))
                ),
            },
            Expression::Wildcard => "*".to_string(),
            Expression::Parameter(idx) => rules.parameter(*idx),
            Expression::Array(elems) => {
                rules.require(rules.arrays, "ARRAY literals")?;
                format!("ARRAY[{}]", self.list(elems, |e| self.expr(e))?)
            }
            Expression::JsonAccess {
                expr,
                path,
                as_text,
            } => {
                rules.require(rules.json_operators, "JSON operators")?;
                let op = if *as_text { "->>" } else { "->" };
                format!("{}{}{}", self.expr(expr)?, op, self.expr(path)?)
            }
            Expression::Nested(expr) => format!("({})", self.expr(expr)?),
            Expression::Opaque(text) => text.clone(),
        })
    }

    fn window_spec(&self, spec: &WindowSpec) -> PipelineResult<String> {
        let mut parts = Vec::new();

        if !spec.partition_by.is_empty() {
            parts.push(format!(
                "PARTITION BY {}",
                self.list(&spec.partition_by, |e| self.expr(e))?
            ));
        }
        if !spec.order_by.is_empty() {
            parts.push(format!(
                "ORDER BY {}",
                self.list(&spec.order_by, |o| self.order_by(o))?
            ));
        }
        if let Some(ref frame) = spec.frame {
            parts.push(frame.clone());
        }

        Ok(parts.join(" "))
    }

    fn order_by(&self, order: &OrderByExpr) -> PipelineResult<String> {
        let mut s = self.expr(&order.expr)?;
        match order.asc {
            Some(true) => s.push_str(" ASC"),
            Some(false) => s.push_str(" DESC"),
            None => {}
        }
        if let Some(first) = order.nulls_first {
            self.rules
                .require(self.rules.nulls_ordering, "NULLS FIRST/LAST")?;
            s.push_str(if first { " NULLS FIRST" } else { " NULLS LAST" });
        }
        Ok(s)
    }

    fn cte(&self, cte: &CTEQuery) -> PipelineResult<String> {
        let recursive = if cte.recursive { "RECURSIVE " } else { "" };
        let ctes = self.list(&cte.ctes, |c| {
            let cols = if c.columns.is_empty() {
                String::new()
            } else {
                format!("({})", self.list(&c.columns, |col| Ok(self.ident(col)))?)
            };
            Ok(format!(
                "{}{} AS ({})",
                self.ident(&c.name),
                cols,
                self.query(&c.query)?
            ))
        })?;

        Ok(format!("WITH {}{} {}", recursive, ctes, self.query(&cte.body)?))
    }

    fn returning(&self, items: &[SelectItem]) -> PipelineResult<String> {
        if items.is_empty() {
            return Ok(String::new());
        }
        self.rules.require(self.rules.returning, "RETURNING")?;
        Ok(format!(
            " RETURNING {}",
            self.list(items, |i| self.select_item(i))?
        ))
    }

    fn insert(&self, insert: &InsertQuery) -> PipelineResult<String> {
        let table = self.table_ref(&insert.table)?;
        let columns = if insert.columns.is_empty() {
            String::new()
        } else {
            format!(" ({})", self.list(&insert.columns, |c| Ok(self.ident(c)))?)
        };

        let source = match &insert.source {
            InsertSource::Values(rows) => format!(
                "VALUES {}",
                self.list(rows, |row| Ok(format!(
                    "({})",
                    self.list(row, |e| self.expr(e))?
                )))?
            ),
            InsertSource::Query(q) => self.query(q)?,
        };

        Ok(format!(
            "INSERT INTO {}{} {}{}",
            table,
            columns,
            source,
            self.returning(&insert.returning)?
        ))
    }

    fn update(&self, update: &UpdateQuery) -> PipelineResult<String> {
        let sets = self.list(&update.assignments, |a| {
            Ok(format!("{} = {}", self.ident(&a.column), self.expr(&a.value)?))
        })?;
        let filter = match &update.filter {
            Some(f) => format!(" WHERE {}", self.expr(f)?),
            None => String::new(),
        };

        Ok(format!(
            "UPDATE {} SET {}{}{}",
            self.table_ref(&update.table)?,
            sets,
            filter,
            self.returning(&update.returning)?
        ))
    }

    fn delete(&self, delete: &DeleteQuery) -> PipelineResult<String> {
        let filter = match &delete.filter {
            Some(f) => format!(" WHERE {}", self.expr(f)?),
            None => String::new(),
        };

        Ok(format!(
            "DELETE FROM {}{}{}",
            self.table_ref(&delete.table)?,
            filter,
            self.returning(&delete.returning)?
        ))
    }
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(true) => "TRUE".to_string(),
        Literal::Boolean(false) => "FALSE".to_string(),
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{}", f),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}
