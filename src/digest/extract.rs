//! Heuristic table/field/join extraction from query text
//!
//! This is a token scanner, not a SQL parser. It never fails: text it
//! cannot make sense of contributes nothing.

use crate::safety::strip_delimiters;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Tokens that introduce a table reference
const TABLE_INTRODUCERS: [&str; 4] = ["FROM", "JOIN", "INTO", "UPDATE"];

/// Tokens that can follow an introducer but are not tables
const RESERVED: [&str; 4] = ["SELECT", "WITH", "AS", "ON"];

/// Clause boundaries used to cut out SELECT and WHERE bodies
static CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(select|from|where|group\s+by|order\s+by|having|union|limit|offset|fetch|window)\b",
    )
    .expect("valid regex")
});

static JOIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:(?:inner|left|right|full|cross)(?:\s+outer)?\s+)?join\b")
        .expect("valid regex")
});

static FROM_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfrom\s+(\S+)").expect("valid regex"));

static ON_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bon\b").expect("valid regex"));

/// Where a join condition stops
static CONDITION_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:and|or|where|group\s+by|order\s+by|having|union)\b")
        .expect("valid regex")
});

static LOGICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:and|or)\s+").expect("valid regex"));

static AS_ALIAS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+as\s+").expect("valid regex"));

static SELECT_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:distinct\s+|all\s+)?(?:top\s+\(?\d+\)?\s+(?:percent\s+)?)?")
        .expect("valid regex")
});

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[\[\]"`\w$]+(?:\.[\[\]"`\w$]+)*$"#).expect("valid regex")
});

/// A pair of tables joined in one query
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct JoinRef {
    pub left: String,
    pub right: String,
    pub condition: Option<String>,
}

/// Everything pulled out of one query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub tables: BTreeSet<String>,
    pub fields: BTreeSet<String>,
    pub joins: Vec<JoinRef>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.fields.is_empty() && self.joins.is_empty()
    }
}

/// Turns query text into table/field/join references
pub trait QueryExtractor: Send + Sync {
    fn extract(&self, query: &str) -> Extraction;
}

/// Keyword-scanning extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl QueryExtractor for HeuristicExtractor {
    fn extract(&self, query: &str) -> Extraction {
        Extraction {
            tables: extract_tables(query),
            fields: extract_fields(query),
            joins: extract_joins(query),
        }
    }
}

fn is_reserved(token: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(token))
}

/// Strip surrounding punctuation and delimiters from a table token
fn clean_table_token(token: &str) -> Option<String> {
    let head = token.split(',').next().unwrap_or_default();
    let trimmed = head.trim_matches(|c: char| "[](){},;\"`".contains(c));
    let cleaned = strip_delimiters(trimmed);
    if cleaned.is_empty() || is_reserved(&cleaned) || cleaned.starts_with('@') {
        return None;
    }
    Some(cleaned)
}

/// Tables named after FROM, JOIN, INTO or UPDATE
pub fn extract_tables(query: &str) -> BTreeSet<String> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    tokens
        .windows(2)
        .filter(|pair| {
            TABLE_INTRODUCERS
                .iter()
                .any(|kw| kw.eq_ignore_ascii_case(pair[0]))
        })
        .filter_map(|pair| clean_table_token(pair[1]))
        .collect()
}

/// Bodies of every clause matched by `wanted`
fn clause_bodies<'a>(query: &'a str, wanted: &str) -> Vec<&'a str> {
    let marks: Vec<_> = CLAUSE.find_iter(query).collect();
    marks
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            let keyword: String = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            keyword.eq_ignore_ascii_case(wanted)
        })
        .map(|(idx, m)| {
            let end = marks.get(idx + 1).map_or(query.len(), |next| next.start());
            &query[m.end()..end]
        })
        .collect()
}

fn is_literal(token: &str) -> bool {
    token.starts_with('\'')
        || token.starts_with('@')
        || token.starts_with(':')
        || token.starts_with('?')
        || token.parse::<f64>().is_ok()
}

/// Fields named in SELECT lists and WHERE comparisons
pub fn extract_fields(query: &str) -> BTreeSet<String> {
    let mut raw = Vec::new();

    for body in clause_bodies(query, "select") {
        let body = SELECT_PREFIX.replace(body.trim(), "");
        for item in body.split(',') {
            let item = item.trim();
            if item.is_empty() || item == "*" || item.ends_with(".*") || item.contains('(') {
                continue;
            }
            let item = match AS_ALIAS.find(item) {
                Some(alias) => &item[..alias.start()],
                None => item,
            };
            // `col alias` without AS
            let item = item.split_whitespace().next().unwrap_or_default();
            if IDENTIFIER.is_match(item) && !is_literal(item) {
                raw.push(item.to_string());
            }
        }
    }

    for body in clause_bodies(query, "where") {
        let flattened = LOGICAL.replace_all(body, " ");
        for token in flattened.split_whitespace() {
            if !token.contains('.') || token.contains('(') {
                continue;
            }
            let field = token
                .split(['=', '<', '>', '!'])
                .next()
                .unwrap_or_default()
                .trim_matches(|c: char| "[](){},;".contains(c));
            if field.is_empty() || is_literal(field) || !IDENTIFIER.is_match(field) {
                continue;
            }
            raw.push(field.to_string());
        }
    }

    raw.iter().filter_map(|field| normalize_field(field)).collect()
}

/// Remove delimiters and a single-letter alias prefix (`c.name` -> `name`)
fn normalize_field(field: &str) -> Option<String> {
    let cleaned: String = strip_delimiters(field).replace('\'', "");
    let mut chars = cleaned.chars();
    let cleaned = match (chars.next(), chars.next()) {
        (Some(first), Some('.')) if first.is_alphabetic() && cleaned.len() > 2 => {
            cleaned[first.len_utf8() + 1..].to_string()
        }
        _ => cleaned,
    };
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Join condition of one JOIN segment, if it is an equality
fn join_condition(segment: &str) -> Option<String> {
    let on = ON_KEYWORD.find(segment)?;
    let rest = &segment[on.end()..];
    let end = CONDITION_END.find(rest).map_or(rest.len(), |m| m.start());
    let condition = rest[..end].trim().trim_end_matches(';').trim();
    (condition.contains('=')).then(|| condition.to_string())
}

/// Table pairs linked by JOIN, scanned line by line
pub fn extract_joins(query: &str) -> Vec<JoinRef> {
    let mut joins = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut from_encountered = false;

    for line in query.lines() {
        let line = line.trim();

        if !from_encountered {
            if let Some(caps) = FROM_TABLE.captures(line) {
                from_encountered = true;
                if let Some(table) = caps.get(1).and_then(|m| clean_table_token(m.as_str())) {
                    seen.push(table);
                }
            }
        }

        let marks: Vec<_> = JOIN.find_iter(line).collect();
        for (idx, mark) in marks.iter().enumerate() {
            let end = marks.get(idx + 1).map_or(line.len(), |next| next.start());
            let segment = &line[mark.end()..end];

            let Some(joined) = segment
                .split_whitespace()
                .next()
                .and_then(clean_table_token)
            else {
                continue;
            };

            let condition = join_condition(segment);
            for previous in &seen {
                joins.push(JoinRef {
                    left: previous.clone(),
                    right: joined.clone(),
                    condition: condition.clone(),
                });
            }
            if !seen.contains(&joined) {
                seen.push(joined);
            }
        }
    }

    joins
}
