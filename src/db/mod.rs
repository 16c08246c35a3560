//! Database access layer
//!
//! Tools never talk to a driver directly. They go through two seams:
//! - [`SqlExecutor`] runs a prepared statement with positional parameters
//! - [`Catalog`] answers metadata questions (tables, columns, keys, indexes)
//!
//! [`SqliteDatabase`] implements both over a deadpool-sqlite pool.

mod pool;
mod sqlite;

pub use pool::{PoolHealth, PoolOptions, SqlitePool};
pub use sqlite::SqliteDatabase;

#[cfg(test)]
pub(crate) use sqlite::tests::{fixture_db, open_fixture};

use crate::safety::{LimitSyntax, TableRef};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

/// Errors raised by the database adapter
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open database {path}: {message}")]
    Connect { path: String, message: String },

    #[error("connection pool exhausted ({0} connections in use)")]
    PoolExhausted(usize),

    #[error("query interrupted after {0}s")]
    Timeout(u64),

    #[error("connection task failed: {0}")]
    Interact(String),

    #[error("{0}")]
    Query(#[from] rusqlite::Error),
}

/// Rows returned by a query
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// More rows were available than `max_rows`
    pub truncated: bool,
}

/// A table or view visible in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub kind: TableKind,
    pub column_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub position: usize,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// 1-based position in the primary key, if part of it
    pub primary_key: Option<usize>,
}

/// One column pair of a foreign key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub constraint_id: i64,
    pub fk_table: TableRef,
    pub fk_column: String,
    pub pk_table: TableRef,
    pub pk_column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForeignKeys {
    /// Keys declared on this table
    pub outgoing: Vec<ForeignKeyInfo>,
    /// Keys on other tables that reference this one
    pub incoming: Vec<ForeignKeyInfo>,
}

impl ForeignKeys {
    pub fn all(&self) -> impl Iterator<Item = &ForeignKeyInfo> {
        self.outgoing.iter().chain(self.incoming.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    /// `c` for CREATE INDEX, `u` for UNIQUE, `pk` for the primary key
    pub origin: String,
    pub columns: Vec<String>,
}

/// Size and shape of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub row_count: u64,
    pub column_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub engine: String,
    pub version: String,
    pub file: Option<String>,
    pub page_size: i64,
    pub page_count: i64,
    pub journal_mode: String,
    pub encoding: String,
    pub schemas: Vec<String>,
}

/// Runs statements against the database
#[async_trait::async_trait]
pub trait SqlExecutor: Send + Sync {
    /// How this dialect spells a row limit
    fn limit_syntax(&self) -> LimitSyntax;

    /// Run `sql` with positional `params`, fetching at most `max_rows` rows
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        max_rows: Option<usize>,
    ) -> Result<QueryOutput, DbError>;

    /// Connection pool counters, for adapters that pool
    fn pool_health(&self) -> Option<PoolHealth> {
        None
    }

    /// Run `sql` and return the first column of the first row
    async fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, DbError> {
        let output = self.query(sql, params, Some(1)).await?;
        Ok(output
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, value)| value)))
    }
}

/// Answers metadata questions
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Schema names present in the database
    async fn schemas(&self) -> Result<Vec<String>, DbError>;

    async fn list_tables(
        &self,
        schema: Option<&str>,
        include_views: bool,
    ) -> Result<Vec<TableInfo>, DbError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, DbError>;

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>, DbError>;

    async fn foreign_keys(&self, table: &TableRef) -> Result<ForeignKeys, DbError>;

    async fn indexes(&self, table: &TableRef) -> Result<Vec<IndexInfo>, DbError>;

    /// `None` if the table does not exist
    async fn table_stats(&self, table: &TableRef) -> Result<Option<TableStats>, DbError>;

    async fn database_info(&self) -> Result<DatabaseInfo, DbError>;
}
