//! Usage digest
//!
//! The digest accumulates how often tables, fields and joins show up in
//! captured query text. Each refresh extracts a fresh digest from recent
//! history and merges it into the persisted one:
//! - counts are summed
//! - `first_seen` keeps the earliest timestamp, `last_seen` the latest
//! - descriptive attributes (row/column counts, join condition) come from
//!   the newer side when it has them
//!
//! The last rule makes merging asymmetric on purpose: the newer digest
//! reflects a more recent catalog lookup.

mod export;
mod extract;
mod history;
mod service;
mod store;

pub use export::{default_export_path, export, import_json, ExportFormat};
pub use extract::{Extraction, HeuristicExtractor, JoinRef, QueryExtractor};
pub use history::{JsonLinesHistory, QueryHistorySource, QueryObservation, StaticHistory};
pub use service::{
    DigestOptions, DigestService, DigestView, ImportanceMetrics, JoinSource, JoinSuggestion,
    JoinSuggestionMetadata, JoinSuggestions, Ranked, RefreshOutcome, TableImportance,
};
pub use store::DigestStore;

use crate::db::DbError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Digest timestamps are always UTC
pub type Timestamp = DateTime<Utc>;

/// Errors raised while building, persisting or exporting the digest
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid digest document: {0}")]
    Format(#[from] serde_json::Error),

    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("XML export failed: {0}")]
    Xml(String),

    #[error("query history unavailable: {0}")]
    History(String),

    #[error("no query statistics found")]
    NoStatistics,

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("a history window of {0} days reaches past the supported date range")]
    InvalidWindow(u32),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

/// Usage of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUsage {
    pub schema: String,
    pub name: String,
    pub query_count: u64,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub column_count: Option<usize>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// Usage of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUsage {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    pub query_count: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// Usage of one table pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinUsage {
    pub table1: String,
    pub table2: String,
    pub query_count: u64,
    #[serde(default)]
    pub join_fields: Option<String>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// The persisted aggregate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDigest {
    #[serde(default)]
    pub last_updated: Option<Timestamp>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub tables: BTreeMap<String, TableUsage>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldUsage>,
    #[serde(default)]
    pub joins: BTreeMap<String, JoinUsage>,
}

/// Key under which a join between two tables is recorded
pub fn join_key(table1: &str, table2: &str) -> String {
    format!("{table1}|{table2}")
}

/// Shared merge behavior of the three record kinds
trait UsageRecord: Clone {
    fn absorb(&mut self, newer: &Self);
}

fn merge_seen(
    first: &mut Timestamp,
    last: &mut Timestamp,
    newer_first: Timestamp,
    newer_last: Timestamp,
) {
    *first = (*first).min(newer_first);
    *last = (*last).max(newer_last);
}

impl UsageRecord for TableUsage {
    fn absorb(&mut self, newer: &Self) {
        self.query_count += newer.query_count;
        merge_seen(
            &mut self.first_seen,
            &mut self.last_seen,
            newer.first_seen,
            newer.last_seen,
        );
        self.schema = newer.schema.clone();
        self.name = newer.name.clone();
        self.row_count = newer.row_count.or(self.row_count);
        self.column_count = newer.column_count.or(self.column_count);
    }
}

impl UsageRecord for FieldUsage {
    fn absorb(&mut self, newer: &Self) {
        self.query_count += newer.query_count;
        merge_seen(
            &mut self.first_seen,
            &mut self.last_seen,
            newer.first_seen,
            newer.last_seen,
        );
        self.name = newer.name.clone();
        self.table = newer.table.clone().or_else(|| self.table.take());
    }
}

impl UsageRecord for JoinUsage {
    fn absorb(&mut self, newer: &Self) {
        self.query_count += newer.query_count;
        merge_seen(
            &mut self.first_seen,
            &mut self.last_seen,
            newer.first_seen,
            newer.last_seen,
        );
        self.join_fields = newer.join_fields.clone().or_else(|| self.join_fields.take());
    }
}

fn merge_maps<R: UsageRecord>(
    older: &BTreeMap<String, R>,
    newer: &BTreeMap<String, R>,
) -> BTreeMap<String, R> {
    let mut merged = older.clone();
    for (key, record) in newer {
        merged
            .entry(key.clone())
            .and_modify(|existing| existing.absorb(record))
            .or_insert_with(|| record.clone());
    }
    merged
}

impl UsageDigest {
    /// Nothing has ever been merged into this digest
    pub fn is_empty(&self) -> bool {
        self.usage_count == 0
            && self.tables.is_empty()
            && self.fields.is_empty()
            && self.joins.is_empty()
    }

    /// Merge a newer digest into this one
    pub fn merge(&self, newer: &UsageDigest) -> UsageDigest {
        let last_updated = match (self.last_updated, newer.last_updated) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => b.or(a),
        };

        UsageDigest {
            last_updated,
            usage_count: self.usage_count + newer.usage_count,
            tables: merge_maps(&self.tables, &newer.tables),
            fields: merge_maps(&self.fields, &newer.fields),
            joins: merge_maps(&self.joins, &newer.joins),
        }
    }

    /// Whether a refresh at `now` should run
    pub fn is_stale(&self, now: Timestamp, freshness: Duration) -> bool {
        if self.is_empty() {
            return true;
        }
        match self.last_updated {
            Some(updated) => now - updated > freshness,
            None => true,
        }
    }

    /// Record one table reference seen `count` times
    pub(crate) fn add_table(
        &mut self,
        key: &str,
        schema: &str,
        name: &str,
        count: u64,
        now: Timestamp,
    ) {
        let record = TableUsage {
            schema: schema.to_string(),
            name: name.to_string(),
            query_count: count,
            row_count: None,
            column_count: None,
            first_seen: now,
            last_seen: now,
        };
        self.tables
            .entry(key.to_string())
            .and_modify(|existing| existing.absorb(&record))
            .or_insert(record);
    }

    pub(crate) fn add_field(&mut self, key: &str, count: u64, now: Timestamp) {
        let (table, name) = match key.rsplit_once('.') {
            Some((table, name)) => (Some(table.to_string()), name.to_string()),
            None => (None, key.to_string()),
        };
        let record = FieldUsage {
            name,
            table,
            query_count: count,
            first_seen: now,
            last_seen: now,
        };
        self.fields
            .entry(key.to_string())
            .and_modify(|existing| existing.absorb(&record))
            .or_insert(record);
    }

    pub(crate) fn add_join(&mut self, join: &JoinRef, count: u64, now: Timestamp) {
        let record = JoinUsage {
            table1: join.left.clone(),
            table2: join.right.clone(),
            query_count: count,
            join_fields: join.condition.clone(),
            first_seen: now,
            last_seen: now,
        };
        self.joins
            .entry(join_key(&join.left, &join.right))
            .and_modify(|existing| existing.absorb(&record))
            .or_insert(record);
    }
}
