//! Pull the statement out of a completion.

use crate::dialect::Dialect;
use crate::error::{PipelineError, PipelineResult};
use crate::validate::statement_count;

/// First ```sql (or untagged) fenced block, else the whole response.
fn fenced_block(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let line = after.split('\n').next().unwrap_or_default();
        if let Some(close) = line.find("```") {
            let inline = line[..close].trim();
            return Some(match inline.split_once(char::is_whitespace) {
                Some((tag, sql)) if tag.eq_ignore_ascii_case("sql") => sql.trim_start(),
                _ => inline,
            });
        }
        // a tag is one word; anything else on the opening line is code
        let (tag, body) = match after.split_once('\n') {
            Some((first, body)) if !first.trim().contains(char::is_whitespace) => {
                (first.trim(), body)
            }
            _ => ("", after),
        };
        let end = body.find("```").unwrap_or(body.len());
        if tag.is_empty() || tag.eq_ignore_ascii_case("sql") {
            return Some(&body[..end]);
        }
        rest = body.get(end + 3..).unwrap_or("");
    }
    None
}

pub(super) fn extract_statement(
    text: &str,
    dialect: Dialect,
    allow_multi_statement: bool,
) -> PipelineResult<String> {
    let body = fenced_block(text).unwrap_or(text).trim();
    let statement = body.strip_suffix(';').unwrap_or(body).trim_end();
    if statement.is_empty() {
        return Err(PipelineError::CompletionService(
            "completion contained no statement".into(),
        ));
    }

    if !allow_multi_statement {
        if let Some(count) = statement_count(statement, dialect).filter(|n| *n > 1) {
            return Err(PipelineError::unsafe_statement(
                format!("completion contained {count} statements"),
                statement,
            ));
        }
    }
    Ok(statement.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> PipelineResult<String> {
        extract_statement(text, Dialect::Postgres, false)
    }

    #[test]
    fn test_sql_fence() {
        let text = "Here you go:\n```sql\nSELECT id FROM orders;\n```\nThis lists ids.";
        assert_eq!(extract(text).unwrap(), "SELECT id FROM orders");
    }

    #[test]
    fn test_bare_fence_and_other_languages() {
        let text = "```python\nprint(1)\n```\n```\nSELECT 2\n```";
        assert_eq!(extract(text).unwrap(), "SELECT 2");
    }

    #[test]
    fn test_plain_response() {
        assert_eq!(extract("  SELECT 1;  \n").unwrap(), "SELECT 1");
    }

    #[test]
    fn test_fence_closed_on_opening_line() {
        assert_eq!(extract("```SELECT 1```\nthanks").unwrap(), "SELECT 1");
        assert_eq!(
            extract("Sure: ```sql SELECT id FROM orders;``` done").unwrap(),
            "SELECT id FROM orders"
        );
        assert_eq!(
            extract("```SELECT id\nFROM orders\n```").unwrap(),
            "SELECT id\nFROM orders"
        );
    }

    #[test]
    fn test_unterminated_fence() {
        assert_eq!(extract("```sql\nSELECT 3").unwrap(), "SELECT 3");
    }

    #[test]
    fn test_empty_response() {
        for text in ["", "   ", "```sql\n```", ";"] {
            assert!(
                matches!(extract(text), Err(PipelineError::CompletionService(_))),
                "{text:?}"
            );
        }
    }

    #[test]
    fn test_multiple_statements() {
        let err = extract("SELECT 1; DROP TABLE orders;").unwrap_err();
        assert!(matches!(err, PipelineError::UnsafeStatement { .. }));
        assert_eq!(
            extract_statement("SELECT 1; SELECT 2", Dialect::Sqlite, true).unwrap(),
            "SELECT 1; SELECT 2"
        );
    }
}
