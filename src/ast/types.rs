//! Dialect-neutral statement tree.
//!
//! Every stage after parsing works on these types: the validator resolves
//! references in them, the dialect adapter renders them, and the advisor
//! inspects them. The tree is clone-based and never mutated in place.

use serde::Serialize;

/// Top-level statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Query {
    Select(Box<SelectQuery>),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
    /// Common Table Expressions wrapping an inner statement.
    With(CTEQuery),
    /// CREATE / ALTER / DROP / TRUNCATE, kept as normalized text.
    Ddl(DdlStatement),
    /// Any other statement (SET, GRANT, COPY, ...). Never executable.
    Raw(String),
}

/// A SELECT query with all standard SQL clauses.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Vec<TableRef>,
    pub joins: Vec<Join>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub having: Option<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expression>,
    pub offset: Option<Expression>,
    /// Set operations (UNION, INTERSECT, EXCEPT).
    pub set_op: Option<Box<SetOperation>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `table.*`
    QualifiedWildcard(String),
    /// `expr AS alias`
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Relation in a FROM or JOIN clause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TableRef {
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    Subquery {
        query: Box<Query>,
        alias: String,
    },
    /// Table-valued function: `generate_series(1, 10) AS g(n)`
    Function {
        name: String,
        args: Vec<Expression>,
        alias: Option<String>,
        /// Output column names given in the alias.
        columns: Vec<String>,
    },
}

impl TableRef {
    /// Name other clauses use to refer to this relation.
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            TableRef::Table { name, alias, .. } | TableRef::Function { name, alias, .. } => {
                Some(alias.as_deref().unwrap_or(name))
            }
            TableRef::Subquery { alias, .. } => Some(alias),
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        match self {
            TableRef::Table { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub condition: Option<JoinCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JoinCondition {
    On(Expression),
    Using(Vec<String>),
    Natural,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expression {
    /// `table.column` or `column`.
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Literal),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// Scalar function call. Names are upper-cased.
    Function {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    Aggregate {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    WindowFunction {
        function: Box<Expression>,
        window: WindowSpec,
    },
    Case {
        operand: Option<Box<Expression>>,
        when_clauses: Vec<(Expression, Expression)>,
        else_clause: Option<Box<Expression>>,
    },
    Subquery(Box<Query>),
    Exists(Box<Query>),
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expression>,
        subquery: Box<Query>,
        negated: bool,
    },
    Between {
        expr: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// `CAST(expr AS type)`
    Cast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// `expr::type` (PostgreSQL only).
    TypeCast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// `EXTRACT(field FROM expr)`
    Extract {
        field: String,
        expr: Box<Expression>,
    },
    /// `INTERVAL '1' DAY`
    Interval {
        value: Box<Expression>,
        unit: Option<String>,
    },
    /// `DATE '2024-01-01'`
    TypedString {
        data_type: String,
        value: String,
    },
    /// `*` inside `COUNT(*)`.
    Wildcard,
    /// `$1`, `$2`, ...
    Parameter(usize),
    Array(Vec<Expression>),
    /// `expr->key`, `expr->>key`.
    JsonAccess {
        expr: Box<Expression>,
        path: Box<Expression>,
        as_text: bool,
    },
    Nested(Box<Expression>),
    /// A construct the tree does not model. Kept verbatim so that the
    /// validator can refuse it instead of losing the identifiers inside.
    Opaque(String),
}

impl Expression {
    pub fn column(table: Option<&str>, name: &str) -> Self {
        Expression::Column {
            table: table.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Strip redundant parentheses.
    pub fn unnested(&self) -> &Expression {
        match self {
            Expression::Nested(inner) => inner.unnested(),
            other => other,
        }
    }

    /// Split a predicate into its top-level AND-ed conjuncts.
    pub fn conjuncts(&self) -> Vec<&Expression> {
        match self.unnested() {
            Expression::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                let mut parts = left.conjuncts();
                parts.extend(right.conjuncts());
                parts
            }
            other => vec![other],
        }
    }

    /// Direct child expressions (subqueries are not descended into).
    pub fn children(&self) -> Vec<&Expression> {
        match self {
            Expression::BinaryOp { left, right, .. } => vec![left, right],
            Expression::UnaryOp { expr, .. }
            | Expression::IsNull { expr, .. }
            | Expression::Cast { expr, .. }
            | Expression::TypeCast { expr, .. }
            | Expression::Extract { expr, .. }
            | Expression::InSubquery { expr, .. }
            | Expression::Nested(expr) => vec![expr],
            Expression::Interval { value, .. } => vec![value],
            Expression::Function { args, .. } | Expression::Aggregate { args, .. } => {
                args.iter().collect()
            }
            Expression::Array(items) => items.iter().collect(),
            Expression::WindowFunction { function, window } => {
                let mut out: Vec<&Expression> = vec![function];
                out.extend(window.partition_by.iter());
                out.extend(window.order_by.iter().map(|o| &o.expr));
                out
            }
            Expression::Case {
                operand,
                when_clauses,
                else_clause,
            } => {
                let mut out: Vec<&Expression> = Vec::new();
                if let Some(op) = operand {
                    out.push(op);
                }
                for (w, t) in when_clauses {
                    out.push(w);
                    out.push(t);
                }
                if let Some(e) = else_clause {
                    out.push(e);
                }
                out
            }
            Expression::InList { expr, list, .. } => {
                let mut out: Vec<&Expression> = vec![expr];
                out.extend(list.iter());
                out
            }
            Expression::Between {
                expr, low, high, ..
            } => vec![expr, low, high],
            Expression::JsonAccess { expr, path, .. } => vec![expr, path],
            Expression::Column { .. }
            | Expression::Literal(_)
            | Expression::Subquery(_)
            | Expression::Exists(_)
            | Expression::TypedString { .. }
            | Expression::Wildcard
            | Expression::Parameter(_)
            | Expression::Opaque(_) => vec![],
        }
    }

    /// Subqueries directly embedded in this expression node.
    pub fn subquery(&self) -> Option<&Query> {
        match self {
            Expression::Subquery(q) | Expression::Exists(q) => Some(q),
            Expression::InSubquery { subquery, .. } => Some(subquery),
            _ => None,
        }
    }

    /// Pre-order walk over this expression and all nested expressions,
    /// without entering subqueries.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expression)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Like,
    ILike,
    NotLike,
    NotILike,
    Concat,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Lt | BinaryOperator::LtEq | BinaryOperator::Gt | BinaryOperator::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WindowSpec {
    pub partition_by: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    /// Frame clause kept as rendered text.
    pub frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
    pub nulls_first: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetOperation {
    pub op: SetOperator,
    pub all: bool,
    pub right: Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetOperator {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CTEQuery {
    pub recursive: bool,
    pub ctes: Vec<CTE>,
    pub body: Box<Query>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CTE {
    pub name: String,
    pub columns: Vec<String>,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertQuery {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InsertSource {
    Values(Vec<Vec<Expression>>),
    Query(Box<Query>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateQuery {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Expression>,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub column: String,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteQuery {
    pub table: TableRef,
    pub filter: Option<Expression>,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DdlStatement {
    pub verb: DdlVerb,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DdlVerb {
    Create,
    Alter,
    Drop,
    Truncate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expression {
        Expression::column(None, name)
    }

    fn eq(l: Expression, r: Expression) -> Expression {
        Expression::BinaryOp {
            left: Box::new(l),
            op: BinaryOperator::Eq,
            right: Box::new(r),
        }
    }

    #[test]
    fn test_default_select_query() {
        let q = SelectQuery::default();
        assert!(!q.distinct);
        assert!(q.projections.is_empty());
        assert!(q.filter.is_none());
        assert!(q.limit.is_none());
    }

    #[test]
    fn test_conjuncts_flatten_nested_and() {
        let a = eq(col("a"), Expression::Literal(Literal::Integer(1)));
        let b = eq(col("b"), Expression::Literal(Literal::Integer(2)));
        let c = eq(col("c"), Expression::Literal(Literal::Integer(3)));
        let inner = Expression::Nested(Box::new(Expression::BinaryOp {
            left: Box::new(a),
            op: BinaryOperator::And,
            right: Box::new(b),
        }));
        let expr = Expression::BinaryOp {
            left: Box::new(inner),
            op: BinaryOperator::And,
            right: Box::new(c),
        };
        assert_eq!(expr.conjuncts().len(), 3);
    }

    #[test]
    fn test_or_is_single_conjunct() {
        let expr = Expression::BinaryOp {
            left: Box::new(col("a")),
            op: BinaryOperator::Or,
            right: Box::new(col("b")),
        };
        assert_eq!(expr.conjuncts().len(), 1);
    }

    #[test]
    fn test_walk_visits_columns() {
        let expr = Expression::Between {
            expr: Box::new(col("price")),
            low: Box::new(Expression::Literal(Literal::Integer(1))),
            high: Box::new(col("cap")),
            negated: false,
        };
        let mut names = Vec::new();
        expr.walk(&mut |e| {
            if let Expression::Column { name, .. } = e {
                names.push(name.clone());
            }
        });
        assert_eq!(names, vec!["price", "cap"]);
    }

    #[test]
    fn test_binding_name_prefers_alias() {
        let t = TableRef::Table {
            schema: None,
            name: "orders".into(),
            alias: Some("o".into()),
        };
        assert_eq!(t.binding_name(), Some("o"));
        assert_eq!(t.table_name(), Some("orders"));
    }
}
