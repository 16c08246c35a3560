//! Structured tool failures

use crate::db::DbError;
use crate::digest::DigestError;
use crate::safety::{AccessError, Rejection};
use serde_json::{json, Value};
use thiserror::Error;

/// Failure of a single tool call. Never fatal to the process.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    Persistence(String),

    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    /// Stable category reported to callers
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation_error",
            ToolError::NotFound(_) => "not_found",
            ToolError::Database(_) => "database_error",
            ToolError::Persistence(_) => "persistence_error",
            ToolError::Internal(_) => "internal_error",
        }
    }

    /// `{"error": code, "details": message}`
    pub fn to_json(&self) -> Value {
        json!({
            "error": self.code(),
            "details": self.to_string(),
        })
    }
}

impl From<AccessError> for ToolError {
    fn from(e: AccessError) -> Self {
        ToolError::Validation(e.to_string())
    }
}

impl From<Rejection> for ToolError {
    fn from(r: Rejection) -> Self {
        ToolError::Validation(format!("query rejected: {r}"))
    }
}

impl From<DbError> for ToolError {
    fn from(e: DbError) -> Self {
        ToolError::Database(e.to_string())
    }
}

impl From<DigestError> for ToolError {
    fn from(e: DigestError) -> Self {
        match e {
            DigestError::NoStatistics | DigestError::TableNotFound(_) => {
                ToolError::NotFound(e.to_string())
            }
            DigestError::InvalidWindow(_) => ToolError::Validation(e.to_string()),
            DigestError::Task(_) => ToolError::Internal(e.to_string()),
            DigestError::Database(inner) => ToolError::Database(inner.to_string()),
            DigestError::History(_) => ToolError::Database(e.to_string()),
            other => ToolError::Persistence(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Validation(format!("invalid arguments: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ToolError::Validation("x".into()).code(), "validation_error");
        assert_eq!(ToolError::NotFound("x".into()).code(), "not_found");
        assert_eq!(ToolError::Database("x".into()).code(), "database_error");
        assert_eq!(ToolError::Persistence("x".into()).code(), "persistence_error");
        assert_eq!(ToolError::Internal("x".into()).code(), "internal_error");
    }

    #[test]
    fn test_json_shape() {
        let err: ToolError = Rejection::StackedStatement.into();
        assert_eq!(
            err.to_json(),
            json!({
                "error": "validation_error",
                "details": "query rejected: multiple statements are not allowed",
            })
        );
    }

    #[test]
    fn test_digest_error_mapping() {
        assert_eq!(ToolError::from(DigestError::NoStatistics).code(), "not_found");
        assert_eq!(
            ToolError::from(DigestError::Xml("bad".into())).code(),
            "persistence_error"
        );
        assert_eq!(
            ToolError::from(AccessError::SchemaNotAllowed("x".into())).code(),
            "validation_error"
        );
    }
}
