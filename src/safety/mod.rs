//! Read-only query validation
//!
//! Every free-form statement passes through [`check`] before it reaches the
//! database. Matching is textual and deliberately strict: a write keyword
//! anywhere in the text rejects the query, including inside string literals
//! and aliases.

mod identifiers;
mod limit;

pub(crate) use identifiers::strip_delimiters;
pub use identifiers::{
    quote_ident, validate_column_name, validate_table_name, AccessError, AccessPolicy, TableRef,
};
pub use limit::{has_limiting_clause, with_row_limit, LimitSyntax};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

static LEADING_SELECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*select\b").expect("valid regex"));

static PROHIBITED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:insert|update|delete|drop|alter|create|truncate|exec|execute)\b|\bsp_\w+|\bxp_\w+|\binto\s+outfile\b|\binto\s+dumpfile\b",
    )
    .expect("valid regex")
});

static STACKED: Lazy<Regex> = Lazy::new(|| Regex::new(r";\s*\S").expect("valid regex"));

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)--[ \t]*\r?$|/\*|\*/").expect("valid regex"));

/// Why a query was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    NotSelect,
    ProhibitedKeyword,
    StackedStatement,
    CommentMarker,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Rejection::NotSelect => "only SELECT statements are allowed",
            Rejection::ProhibitedKeyword => "query contains a prohibited keyword",
            Rejection::StackedStatement => "multiple statements are not allowed",
            Rejection::CommentMarker => "comment markers are not allowed",
        };
        f.write_str(msg)
    }
}

/// Validate a query, returning the first rule it breaks
pub fn check(query: &str) -> Result<(), Rejection> {
    if !LEADING_SELECT.is_match(query) {
        return Err(Rejection::NotSelect);
    }
    if PROHIBITED.is_match(query) {
        return Err(Rejection::ProhibitedKeyword);
    }
    if STACKED.is_match(query) {
        return Err(Rejection::StackedStatement);
    }
    if COMMENT.is_match(query) {
        return Err(Rejection::CommentMarker);
    }
    Ok(())
}

/// `true` when the query may be executed
pub fn is_safe(query: &str) -> bool {
    check(query).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_select_is_safe() {
        assert!(is_safe("SELECT * FROM t"));
        assert!(is_safe("  select a, b from t where a = 1  "));
        assert!(is_safe("SELECT * FROM t;"));
        assert!(is_safe("SELECT * FROM t ;  \n"));
        assert!(is_safe("SELECT\n  a\nFROM t"));
    }

    #[test]
    fn test_non_select_rejected() {
        for q in [
            "",
            "   ",
            "WITH x AS (SELECT 1) SELECT * FROM x",
            "PRAGMA table_info(t)",
            "SELECTED FROM t",
            "EXPLAIN SELECT 1",
        ] {
            assert_eq!(check(q), Err(Rejection::NotSelect), "{q:?}");
        }
    }

    #[test]
    fn test_prohibited_keywords_anywhere() {
        for q in [
            "SELECT * FROM t; DROP TABLE t",
            "SELECT 'drop' AS x FROM t",
            "SELECT created, updated AS update FROM t",
            "SELECT * FROM t WHERE name = 'INSERT'",
            "SELECT exec FROM t",
            "SELECT * FROM sp_who",
            "SELECT xp_cmdshell FROM t",
            "SELECT * FROM t INTO OUTFILE '/tmp/x'",
            "SELECT * FROM t into   dumpfile '/tmp/x'",
        ] {
            assert_eq!(check(q), Err(Rejection::ProhibitedKeyword), "{q:?}");
        }
    }

    #[test]
    fn test_keyword_substrings_are_allowed() {
        assert!(is_safe("SELECT created_at, updates FROM t"));
        assert!(is_safe("SELECT dropped FROM t"));
    }

    #[test]
    fn test_stacked_statements_rejected() {
        assert_eq!(
            check("SELECT 1; SELECT 2"),
            Err(Rejection::StackedStatement)
        );
        assert_eq!(check("SELECT 1;\nSELECT 2"), Err(Rejection::StackedStatement));
    }

    #[test]
    fn test_comment_markers_rejected() {
        assert_eq!(check("SELECT * FROM t --"), Err(Rejection::CommentMarker));
        assert_eq!(
            check("SELECT * FROM t --\nWHERE 1 = 1"),
            Err(Rejection::CommentMarker)
        );
        assert_eq!(check("SELECT /* x */ 1"), Err(Rejection::CommentMarker));
        assert_eq!(check("SELECT 1 */"), Err(Rejection::CommentMarker));
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let q = "SELECT a FROM t WHERE b > 3";
        assert_eq!(check(q), check(q));
        assert_eq!(is_safe(q), is_safe(q));
    }
}
