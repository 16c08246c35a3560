//! Row-limit injection

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static LIMITING_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\btop\b|\blimit\b|\bfetch\s+(?:first|next)\b").expect("valid regex")
});

static SELECT_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*select(?:\s+(?:distinct|all))?\s+").expect("valid regex")
});

/// How a dialect spells a row limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSyntax {
    /// `SELECT TOP n ...`
    Top,
    /// `... LIMIT n`
    Limit,
}

/// `true` when the query already bounds its result
pub fn has_limiting_clause(query: &str) -> bool {
    LIMITING_CLAUSE.is_match(query)
}

/// Bound a SELECT to `limit` rows unless it already carries a limit.
///
/// Applying it twice yields the same text as applying it once.
pub fn with_row_limit(query: &str, limit: usize, syntax: LimitSyntax) -> String {
    if limit == 0 || has_limiting_clause(query) {
        return query.to_string();
    }

    match syntax {
        LimitSyntax::Top => match SELECT_HEAD.find(query) {
            Some(head) => format!(
                "{}TOP {} {}",
                &query[..head.end()],
                limit,
                &query[head.end()..]
            ),
            None => query.to_string(),
        },
        LimitSyntax::Limit => {
            let body = query.trim_end();
            let body = body.strip_suffix(';').unwrap_or(body).trim_end();
            // Own line, so a trailing `--` comment cannot swallow it
            format!("{body}\nLIMIT {limit}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_injected_after_select() {
        assert_eq!(
            with_row_limit("SELECT a FROM t", 10, LimitSyntax::Top),
            "SELECT TOP 10 a FROM t"
        );
        assert_eq!(
            with_row_limit("select distinct a from t", 5, LimitSyntax::Top),
            "select distinct TOP 5 a from t"
        );
    }

    #[test]
    fn test_limit_appended() {
        assert_eq!(
            with_row_limit("SELECT a FROM t;", 10, LimitSyntax::Limit),
            "SELECT a FROM t\nLIMIT 10"
        );
        assert_eq!(
            with_row_limit("SELECT a FROM t  \n", 3, LimitSyntax::Limit),
            "SELECT a FROM t\nLIMIT 3"
        );
    }

    #[test]
    fn test_limit_survives_trailing_line_comment() {
        let limited = with_row_limit("SELECT * FROM t -- newest first", 5, LimitSyntax::Limit);
        assert_eq!(limited, "SELECT * FROM t -- newest first\nLIMIT 5");
        assert_eq!(limited.lines().last(), Some("LIMIT 5"));
    }

    #[test]
    fn test_existing_limit_left_alone() {
        for q in [
            "SELECT TOP 5 a FROM t",
            "SELECT a FROM t LIMIT 5",
            "SELECT a FROM t ORDER BY a OFFSET 0 ROWS FETCH FIRST 5 ROWS ONLY",
            "SELECT a FROM t ORDER BY a OFFSET 10 ROWS FETCH NEXT 5 ROWS ONLY",
        ] {
            assert_eq!(with_row_limit(q, 100, LimitSyntax::Top), q);
            assert_eq!(with_row_limit(q, 100, LimitSyntax::Limit), q);
        }
    }

    #[test]
    fn test_injection_is_idempotent() {
        for syntax in [LimitSyntax::Top, LimitSyntax::Limit] {
            let once = with_row_limit("SELECT * FROM t", 7, syntax);
            let twice = with_row_limit(&once, 7, syntax);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_zero_limit_is_noop() {
        assert_eq!(
            with_row_limit("SELECT 1", 0, LimitSyntax::Limit),
            "SELECT 1"
        );
    }
}
