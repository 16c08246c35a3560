//! Identifier validation and schema allow-listing

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

static TABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+\.)?[\w$]+$").expect("valid regex"));

static COLUMN_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w$]+$").expect("valid regex"));

const FORBIDDEN_CHARS: [char; 4] = ['\'', '"', ';', '\\'];

/// Identifier or allow-list violation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("invalid column name: {0}")]
    InvalidColumnName(String),

    #[error("access to schema '{0}' is not allowed")]
    SchemaNotAllowed(String),
}

/// `schema.table` or `table`, word characters only
pub fn validate_table_name(name: &str) -> bool {
    !name.contains(FORBIDDEN_CHARS) && TABLE_NAME.is_match(name)
}

/// Single identifier, word characters only
pub fn validate_column_name(name: &str) -> bool {
    !name.contains(FORBIDDEN_CHARS) && COLUMN_NAME.is_match(name)
}

/// Remove bracket, quote and backtick delimiters
pub(crate) fn strip_delimiters(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '[' | ']' | '"' | '`'))
        .collect()
}

/// Quote an identifier for SQLite
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A resolved table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Split `schema.table`, `[schema].[table]` or a bare table name
    pub fn parse(raw: &str, default_schema: &str) -> Self {
        let cleaned = strip_delimiters(raw.trim());
        match cleaned.split_once('.') {
            Some((schema, name)) if !schema.is_empty() => Self::new(schema, name),
            Some((_, name)) => Self::new(default_schema, name),
            None => Self::new(default_schema, cleaned),
        }
    }

    /// `schema.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// `"schema"."table"`, safe to splice into SQL
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// Textual forms the same table may be recorded under
    pub fn variants(&self) -> [String; 4] {
        [
            self.qualified(),
            self.name.clone(),
            format!("[{}].[{}]", self.schema, self.name),
            format!("[{}]", self.name),
        ]
    }

    /// Case-insensitive match against a recorded key
    pub fn matches(&self, key: &str) -> bool {
        self.variants()
            .iter()
            .any(|variant| variant.eq_ignore_ascii_case(key))
            || strip_delimiters(key).eq_ignore_ascii_case(&self.qualified())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Allowed schemas plus the schema assumed for unqualified names
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allowed_schemas: Vec<String>,
    default_schema: String,
}

impl AccessPolicy {
    pub fn new(allowed_schemas: Vec<String>, default_schema: impl Into<String>) -> Self {
        Self {
            allowed_schemas,
            default_schema: default_schema.into(),
        }
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn allowed_schemas(&self) -> &[String] {
        &self.allowed_schemas
    }

    pub fn is_allowed(&self, schema: &str) -> bool {
        self.allowed_schemas
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(schema))
    }

    pub fn check_schema(&self, schema: &str) -> Result<(), AccessError> {
        if self.is_allowed(schema) {
            Ok(())
        } else {
            Err(AccessError::SchemaNotAllowed(schema.to_string()))
        }
    }

    /// Validate a caller-supplied table name and check its schema
    pub fn resolve_table(&self, raw: &str) -> Result<TableRef, AccessError> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '[' | ']' | '`'))
            .collect();
        if !validate_table_name(&cleaned) {
            return Err(AccessError::InvalidTableName(raw.to_string()));
        }

        let table = TableRef::parse(&cleaned, &self.default_schema);
        self.check_schema(&table.schema)?;
        Ok(table)
    }

    /// Validate a caller-supplied column name
    pub fn resolve_column(&self, raw: &str) -> Result<String, AccessError> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '[' | ']' | '`'))
            .collect();
        if validate_column_name(&cleaned) {
            Ok(cleaned)
        } else {
            Err(AccessError::InvalidColumnName(raw.to_string()))
        }
    }
}
