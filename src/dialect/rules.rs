//! Per-dialect rewrite table.

use super::Dialect;
use crate::error::{PipelineError, PipelineResult};

/// What a backend accepts and how it spells things.
#[derive(Debug, Clone, PartialEq)]
pub struct DialectRules {
    pub dialect: Dialect,
    /// Identifier quote character.
    pub quote: char,
    pub full_join: bool,
    pub returning: bool,
    pub window_functions: bool,
    pub json_operators: bool,
    pub arrays: bool,
    pub interval_literals: bool,
    pub nulls_ordering: bool,
    pub ilike: bool,
    /// `expr::type`
    pub type_cast_operator: bool,
    /// `a || b` as string concatenation.
    pub concat_operator: bool,
    /// Planner reorders AND-ed predicates by estimated cost.
    pub reorders_predicates: bool,
    pub case_insensitive_identifiers: bool,
}

static POSTGRES: DialectRules = DialectRules {
    dialect: Dialect::Postgres,
    quote: '"',
    full_join: true,
    returning: true,
    window_functions: true,
    json_operators: true,
    arrays: true,
    interval_literals: true,
    nulls_ordering: true,
    ilike: true,
    type_cast_operator: true,
    concat_operator: true,
    reorders_predicates: true,
    case_insensitive_identifiers: true,
};

static MYSQL: DialectRules = DialectRules {
    dialect: Dialect::MySql,
    quote: '`',
    full_join: false,
    returning: false,
    window_functions: true,
    json_operators: false,
    arrays: false,
    interval_literals: true,
    nulls_ordering: false,
    ilike: false,
    type_cast_operator: false,
    concat_operator: false,
    reorders_predicates: true,
    case_insensitive_identifiers: true,
};

static SQLITE: DialectRules = DialectRules {
    dialect: Dialect::Sqlite,
    quote: '"',
    full_join: true,
    returning: true,
    window_functions: true,
    json_operators: true,
    arrays: false,
    interval_literals: false,
    nulls_ordering: true,
    ilike: false,
    type_cast_operator: false,
    concat_operator: true,
    reorders_predicates: false,
    case_insensitive_identifiers: true,
};

static MONGODB: DialectRules = DialectRules {
    dialect: Dialect::MongoDb,
    quote: '"',
    full_join: false,
    returning: false,
    window_functions: false,
    json_operators: false,
    arrays: false,
    interval_literals: false,
    nulls_ordering: false,
    ilike: false,
    type_cast_operator: false,
    concat_operator: false,
    reorders_predicates: false,
    case_insensitive_identifiers: false,
};

const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "check", "column", "create",
    "default", "delete", "desc", "distinct", "drop", "else", "end", "except", "from",
    "grant", "group", "having", "in", "index", "insert", "intersect", "into", "is",
    "join", "key", "left", "like", "limit", "not", "null", "offset", "on", "or", "order",
    "primary", "range", "rank", "references", "right", "rows", "select", "set", "table",
    "then", "to", "union", "update", "user", "using", "values", "when", "where", "window",
    "with",
];

impl DialectRules {
    pub fn for_dialect(dialect: Dialect) -> &'static DialectRules {
        match dialect {
            Dialect::Postgres => &POSTGRES,
            Dialect::MySql => &MYSQL,
            Dialect::Sqlite => &SQLITE,
            Dialect::MongoDb => &MONGODB,
        }
    }

    /// Quote `name` unless it is a plain lowercase identifier and not reserved.
    pub fn quote_ident(&self, name: &str) -> String {
        if is_plain_ident(name) && !RESERVED.contains(&name) {
            return name.to_string();
        }
        let q = self.quote;
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    pub fn require(&self, supported: bool, construct: &str) -> PipelineResult<()> {
        if supported {
            Ok(())
        } else {
            Err(PipelineError::unsupported(construct, self.dialect))
        }
    }

    /// Render a scalar or aggregate call with already-rendered arguments.
    pub fn function_call(
        &self,
        name: &str,
        args: &[String],
        distinct: bool,
    ) -> PipelineResult<String> {
        let d = self.dialect;
        let rendered = match (name, d) {
            ("NOW" | "CURRENT_TIMESTAMP" | "LOCALTIMESTAMP", Dialect::Sqlite) if args.is_empty() => {
                "datetime('now')".to_string()
            }
            ("NOW", _) if args.is_empty() => "NOW()".to_string(),
            ("CURRENT_DATE" | "CURRENT_TIMESTAMP" | "CURRENT_TIME" | "LOCALTIME"
            | "LOCALTIMESTAMP", _)
                if args.is_empty() =>
            {
                name.to_string()
            }
            ("DATE_TRUNC", Dialect::MySql | Dialect::Sqlite) => {
                let [unit, value] = args else {
                    return Err(PipelineError::unsupported("DATE_TRUNC arity", d));
                };
                truncate_date(d, &unit_name(unit), value)?
            }
            ("STRING_AGG", Dialect::MySql) => match args {
                [value, sep] => format!("GROUP_CONCAT({}{value} SEPARATOR {sep})", distinct_kw(distinct)),
                _ => return Err(PipelineError::unsupported("STRING_AGG arity", d)),
            },
            ("STRING_AGG", Dialect::Sqlite) => {
                format!("GROUP_CONCAT({}{})", distinct_kw(distinct), args.join(", "))
            }
            ("GROUP_CONCAT", Dialect::Postgres) => match args {
                [value] => format!("STRING_AGG({}{value}, ',')", distinct_kw(distinct)),
                [value, sep] => format!("STRING_AGG({}{value}, {sep})", distinct_kw(distinct)),
                _ => return Err(PipelineError::unsupported("GROUP_CONCAT arity", d)),
            },
            _ => format!("{name}({}{})", distinct_kw(distinct), args.join(", ")),
        };
        Ok(rendered)
    }

    /// `EXTRACT(field FROM value)`.
    pub fn extract(&self, field: &str, value: &str) -> PipelineResult<String> {
        if self.dialect != Dialect::Sqlite {
            return Ok(format!("EXTRACT({field} FROM {value})"));
        }
        let pattern = match field {
            "YEAR" => "%Y",
            "MONTH" => "%m",
            "DAY" => "%d",
            "HOUR" => "%H",
            "MINUTE" => "%M",
            "SECOND" => "%S",
            "DOW" => "%w",
            "DOY" => "%j",
            _ => {
                return Err(PipelineError::unsupported(
                    format!("EXTRACT({field})"),
                    self.dialect,
                ))
            }
        };
        Ok(format!("CAST(strftime('{pattern}', {value}) AS INTEGER)"))
    }

    /// `INTERVAL` literal; `value` is the raw literal text without quotes.
    pub fn interval(&self, value: &str, unit: Option<&str>) -> PipelineResult<String> {
        self.require(self.interval_literals, "INTERVAL")?;
        match (self.dialect, unit) {
            (Dialect::MySql, Some(unit)) => Ok(format!("INTERVAL {value} {unit}")),
            (Dialect::MySql, None) => {
                // '7 days' -> INTERVAL 7 DAY
                let mut parts = value.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(n), Some(u), None) if n.parse::<i64>().is_ok() => Ok(format!(
                        "INTERVAL {n} {}",
                        u.trim_end_matches(['s', 'S']).to_uppercase()
                    )),
                    _ => Err(PipelineError::unsupported(
                        format!("INTERVAL '{value}'"),
                        self.dialect,
                    )),
                }
            }
            (_, Some(unit)) => Ok(format!("INTERVAL '{value}' {unit}")),
            (_, None) => Ok(format!("INTERVAL '{value}'")),
        }
    }

    /// Target type name for `CAST`.
    pub fn cast_type(&self, data_type: &str) -> String {
        if self.dialect != Dialect::MySql {
            return data_type.to_string();
        }
        let upper = data_type.to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" => "SIGNED".into(),
            "TEXT" | "VARCHAR" | "CHARACTER VARYING" | "STRING" => "CHAR".into(),
            "NUMERIC" | "REAL" | "DOUBLE PRECISION" | "FLOAT" => "DECIMAL".into(),
            "TIMESTAMP" | "TIMESTAMPTZ" => "DATETIME".into(),
            _ => upper,
        }
    }

    pub fn parameter(&self, index: usize) -> String {
        match self.dialect {
            Dialect::MySql => "?".into(),
            Dialect::Sqlite => format!("?{index}"),
            _ => format!("${index}"),
        }
    }
}

fn distinct_kw(distinct: bool) -> &'static str {
    if distinct {
        "DISTINCT "
    } else {
        ""
    }
}

fn unit_name(rendered: &str) -> String {
    rendered.trim_matches('\'').to_lowercase()
}

fn truncate_date(dialect: Dialect, unit: &str, value: &str) -> PipelineResult<String> {
    let format = match unit {
        "year" => "%Y-01-01",
        "month" => "%Y-%m-01",
        "day" => "%Y-%m-%d",
        _ => {
            return Err(PipelineError::unsupported(
                format!("DATE_TRUNC('{unit}')"),
                dialect,
            ))
        }
    };
    Ok(match dialect {
        Dialect::MySql => format!("DATE_FORMAT({value}, '{format}')"),
        _ => format!("strftime('{format}', {value})"),
    })
}

fn is_plain_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        let pg = DialectRules::for_dialect(Dialect::Postgres);
        let my = DialectRules::for_dialect(Dialect::MySql);
        assert_eq!(pg.quote_ident("orders"), "orders");
        assert_eq!(pg.quote_ident("order"), "\"order\"");
        assert_eq!(pg.quote_ident("CreatedAt"), "\"CreatedAt\"");
        assert_eq!(my.quote_ident("user"), "`user`");
        assert_eq!(my.quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_date_trunc_per_dialect() {
        let args = vec!["'month'".to_string(), "created_at".to_string()];
        let pg = DialectRules::for_dialect(Dialect::Postgres);
        let my = DialectRules::for_dialect(Dialect::MySql);
        let lite = DialectRules::for_dialect(Dialect::Sqlite);
        assert_eq!(
            pg.function_call("DATE_TRUNC", &args, false).unwrap(),
            "DATE_TRUNC('month', created_at)"
        );
        assert_eq!(
            my.function_call("DATE_TRUNC", &args, false).unwrap(),
            "DATE_FORMAT(created_at, '%Y-%m-01')"
        );
        assert_eq!(
            lite.function_call("DATE_TRUNC", &args, false).unwrap(),
            "strftime('%Y-%m-01', created_at)"
        );
        let week = vec!["'week'".to_string(), "created_at".to_string()];
        assert!(matches!(
            my.function_call("DATE_TRUNC", &week, false),
            Err(PipelineError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_string_agg_becomes_group_concat() {
        let args = vec!["name".to_string(), "', '".to_string()];
        let my = DialectRules::for_dialect(Dialect::MySql);
        assert_eq!(
            my.function_call("STRING_AGG", &args, false).unwrap(),
            "GROUP_CONCAT(name SEPARATOR ', ')"
        );
    }

    #[test]
    fn test_extract_on_sqlite() {
        let lite = DialectRules::for_dialect(Dialect::Sqlite);
        assert_eq!(
            lite.extract("YEAR", "created_at").unwrap(),
            "CAST(strftime('%Y', created_at) AS INTEGER)"
        );
        assert!(lite.extract("EPOCH", "created_at").is_err());
    }

    #[test]
    fn test_interval_spelling() {
        let my = DialectRules::for_dialect(Dialect::MySql);
        assert_eq!(my.interval("7 days", None).unwrap(), "INTERVAL 7 DAY");
        let lite = DialectRules::for_dialect(Dialect::Sqlite);
        assert!(lite.interval("7 days", None).is_err());
    }

    #[test]
    fn test_mysql_cast_types() {
        let my = DialectRules::for_dialect(Dialect::MySql);
        assert_eq!(my.cast_type("INTEGER"), "SIGNED");
        assert_eq!(my.cast_type("VARCHAR(20)"), "CHAR");
    }
}
