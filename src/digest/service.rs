//! Digest refresh and the queries built on top of it

use super::{
    default_export_path, export, DigestError, DigestStore, ExportFormat, FieldUsage,
    HeuristicExtractor, JoinUsage, QueryExtractor, QueryHistorySource, QueryObservation,
    Timestamp, UsageDigest,
};
use crate::config::DigestSettings;
use crate::db::Catalog;
use crate::safety::TableRef;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Substrings marking system or parameterized statements
const NOISE_PATTERNS: [&str; 7] = [
    "sys.",
    "@",
    "dm_",
    "information_schema",
    "sqlite_master",
    "sqlite_schema",
    "pragma",
];

const TOP_FIELDS: usize = 10;
const TOP_JOINS: usize = 5;
const DESCRIBED_FIELDS: usize = 5;
const DESCRIBED_JOINS: usize = 3;
const EXAMPLE_COLUMNS: usize = 5;

/// Tunables for refresh
#[derive(Debug, Clone)]
pub struct DigestOptions {
    pub freshness: Duration,
    pub min_query_length: usize,
    pub days_history: u32,
    pub max_history_rows: usize,
    pub default_schema: String,
}

impl Default for DigestOptions {
    fn default() -> Self {
        Self {
            freshness: Duration::hours(24),
            min_query_length: 10,
            days_history: 30,
            max_history_rows: 1000,
            default_schema: "main".to_string(),
        }
    }
}

impl DigestOptions {
    pub fn from_settings(settings: &DigestSettings, default_schema: &str) -> Self {
        Self {
            freshness: Duration::hours(settings.freshness_hours as i64),
            min_query_length: settings.min_query_length,
            days_history: settings.days_history,
            max_history_rows: settings.max_history_rows,
            default_schema: default_schema.to_string(),
        }
    }
}

/// Result of a refresh request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Skipped {
        message: String,
        last_updated: Option<Timestamp>,
    },
    #[serde(rename = "success")]
    Updated {
        message: String,
        queries_analyzed: u64,
        tables_tracked: usize,
        fields_tracked: usize,
        joins_tracked: usize,
        last_updated: Option<Timestamp>,
    },
}

/// A digest entry together with its key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked<T> {
    pub key: String,
    #[serde(flatten)]
    pub usage: T,
}

/// Filtered, ranked slice of the digest
#[derive(Debug, Clone, Serialize)]
pub struct DigestView {
    pub last_updated: Option<Timestamp>,
    pub usage_count: u64,
    pub tables: Vec<Ranked<super::TableUsage>>,
    pub fields: Vec<Ranked<FieldUsage>>,
    pub joins: Vec<Ranked<JoinUsage>>,
    pub total_tables: usize,
    pub total_fields: usize,
    pub total_joins: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportanceMetrics {
    pub query_count: u64,
    pub total_queries_analyzed: u64,
    pub usage_percentage: f64,
    pub importance_score: f64,
    pub row_count: Option<u64>,
    pub column_count: Option<usize>,
    pub first_seen: Option<Timestamp>,
    pub last_seen: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableImportance {
    pub table_name: String,
    pub importance_metrics: ImportanceMetrics,
    pub most_queried_fields: Vec<Ranked<FieldUsage>>,
    pub common_joins: Vec<Ranked<JoinUsage>>,
    pub description: String,
}

/// Where a join suggestion came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSource {
    UsageHistory,
    ForeignKey,
    Both,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinSuggestion {
    pub primary_table: String,
    pub secondary_table: String,
    pub join_condition: String,
    pub query_count: u64,
    pub source: JoinSource,
    pub example_query: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinSuggestionMetadata {
    pub max_suggestions: usize,
    pub total_suggestions_found: usize,
    pub usage_based_suggestions: usize,
    pub foreign_key_suggestions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinSuggestions {
    pub table_name: String,
    pub join_suggestions: Vec<JoinSuggestion>,
    pub metadata: JoinSuggestionMetadata,
}

/// A join candidate before the example statement is built
#[derive(Debug, Clone)]
struct Candidate {
    primary: String,
    secondary: String,
    condition: Option<String>,
    query_count: u64,
    source: JoinSource,
}

/// Owns the digest store and everything needed to refresh it
pub struct DigestService {
    store: Arc<DigestStore>,
    history: Arc<dyn QueryHistorySource>,
    catalog: Arc<dyn Catalog>,
    extractor: Box<dyn QueryExtractor>,
    options: DigestOptions,
}

/// Run file work on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, DigestError>
where
    F: FnOnce() -> Result<T, DigestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DigestError::Task(e.to_string()))?
}

/// Start of a `days`-long window ending at `now`
fn window_start(now: Timestamp, days: u32) -> Result<Timestamp, DigestError> {
    Duration::try_days(i64::from(days))
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or(DigestError::InvalidWindow(days))
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// `1234567` -> `1,234,567`
fn with_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Ranked entries at or above `min_count`, most used first
fn rank<T: Clone>(
    entries: impl Iterator<Item = (String, T)>,
    count: impl Fn(&T) -> u64,
    min_count: u64,
    max: usize,
) -> Vec<Ranked<T>> {
    let mut ranked: Vec<_> = entries
        .filter(|(_, usage)| count(usage) >= min_count)
        .map(|(key, usage)| Ranked { key, usage })
        .collect();
    ranked.sort_by(|a, b| count(&b.usage).cmp(&count(&a.usage)));
    ranked.truncate(max);
    ranked
}

impl DigestService {
    pub fn new(
        store: DigestStore,
        history: Arc<dyn QueryHistorySource>,
        catalog: Arc<dyn Catalog>,
        options: DigestOptions,
    ) -> Self {
        Self {
            store: Arc::new(store),
            history,
            catalog,
            extractor: Box::new(HeuristicExtractor),
            options,
        }
    }

    /// Swap in a different extractor
    pub fn with_extractor(mut self, extractor: Box<dyn QueryExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(&self) -> &DigestStore {
        &self.store
    }

    pub fn options(&self) -> &DigestOptions {
        &self.options
    }

    fn table_ref(&self, raw: &str) -> TableRef {
        TableRef::parse(raw, &self.options.default_schema)
    }

    fn is_noise(&self, text: &str) -> bool {
        if text.is_empty() || text.chars().count() < self.options.min_query_length {
            return true;
        }
        let lowered = text.to_lowercase();
        NOISE_PATTERNS.iter().any(|pattern| lowered.contains(pattern))
    }

    // ==================== Refresh ====================

    /// Extract a digest from a batch of observations
    pub async fn build_digest(
        &self,
        observations: &[QueryObservation],
        now: Timestamp,
    ) -> UsageDigest {
        let mut digest = UsageDigest {
            last_updated: Some(now),
            ..Default::default()
        };

        for obs in observations {
            let text = obs.query_text.trim();
            if self.is_noise(text) {
                continue;
            }
            digest.usage_count += 1;

            let extraction = self.extractor.extract(text);
            let count = obs.execution_count;
            for table in &extraction.tables {
                let table_ref = self.table_ref(table);
                digest.add_table(table, &table_ref.schema, &table_ref.name, count, now);
            }
            for field in &extraction.fields {
                digest.add_field(field, count, now);
            }
            for join in &extraction.joins {
                digest.add_join(join, count, now);
            }
        }

        self.attach_table_stats(&mut digest).await;
        digest
    }

    /// Fill row and column counts from the live catalog where the table exists
    async fn attach_table_stats(&self, digest: &mut UsageDigest) {
        for (key, usage) in digest.tables.iter_mut() {
            let table = TableRef::new(usage.schema.clone(), usage.name.clone());
            match self.catalog.table_stats(&table).await {
                Ok(Some(stats)) => {
                    usage.row_count = Some(stats.row_count);
                    usage.column_count = Some(stats.column_count);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("No catalog stats for {}: {}", key, e),
            }
        }
    }

    pub async fn refresh(
        &self,
        force: bool,
        days: Option<u32>,
    ) -> Result<RefreshOutcome, DigestError> {
        self.refresh_at(Utc::now(), force, days).await
    }

    /// Merge recent history into the stored digest unless it is still fresh.
    ///
    /// The freshness check is advisory; only the final read-merge-write runs
    /// under the store lock.
    pub async fn refresh_at(
        &self,
        now: Timestamp,
        force: bool,
        days: Option<u32>,
    ) -> Result<RefreshOutcome, DigestError> {
        let days = days.unwrap_or(self.options.days_history);
        let since = window_start(now, days)?;

        let store = self.store.clone();
        let current = blocking(move || Ok(store.load())).await?;
        if !force && !current.is_stale(now, self.options.freshness) {
            tracing::info!("Usage digest is fresh, skipping refresh");
            return Ok(RefreshOutcome::Skipped {
                message: format!(
                    "Usage digest was updated within the last {} hours; \
                     pass force to refresh anyway",
                    self.options.freshness.num_hours()
                ),
                last_updated: current.last_updated,
            });
        }

        let history = self.history.clone();
        let limit = self.options.max_history_rows;
        let observations = blocking(move || history.fetch(since, limit)).await?;

        let fresh = self.build_digest(&observations, now).await;
        if fresh.usage_count == 0 {
            return Err(DigestError::NoStatistics);
        }
        let analyzed = fresh.usage_count;

        let store = self.store.clone();
        let digest =
            blocking(move || store.update(|current| Ok(Some(current.merge(&fresh))))).await?;

        tracing::info!(
            "Usage digest refreshed with {} queries ({} tables tracked)",
            analyzed,
            digest.tables.len()
        );
        Ok(RefreshOutcome::Updated {
            message: format!(
                "Updated usage digest with {analyzed} queries from the last {days} days"
            ),
            queries_analyzed: analyzed,
            tables_tracked: digest.tables.len(),
            fields_tracked: digest.fields.len(),
            joins_tracked: digest.joins.len(),
            last_updated: digest.last_updated,
        })
    }

    // ==================== Queries ====================

    /// The stored digest, read on the blocking pool
    pub async fn load(&self) -> Result<UsageDigest, DigestError> {
        let store = self.store.clone();
        blocking(move || Ok(store.load())).await
    }

    /// Entries with at least `min_query_count` uses, most used first
    pub async fn view(
        &self,
        min_query_count: u64,
        max_results: usize,
    ) -> Result<DigestView, DigestError> {
        let digest = self.load().await?;
        let (min, max) = (min_query_count, max_results);
        Ok(DigestView {
            last_updated: digest.last_updated,
            usage_count: digest.usage_count,
            total_tables: digest.tables.len(),
            total_fields: digest.fields.len(),
            total_joins: digest.joins.len(),
            tables: rank(digest.tables.into_iter(), |t| t.query_count, min, max),
            fields: rank(digest.fields.into_iter(), |f| f.query_count, min, max),
            joins: rank(digest.joins.into_iter(), |j| j.query_count, min, max),
        })
    }

    pub async fn table_importance(&self, table: &str) -> Result<TableImportance, DigestError> {
        let table_ref = self.table_ref(table);
        let digest = self.load().await?;

        let Some((_, usage)) = digest.tables.iter().find(|(key, _)| table_ref.matches(key)) else {
            return self
                .unqueried_importance(&table_ref, digest.usage_count)
                .await;
        };

        let related_fields: BTreeMap<String, FieldUsage> = digest
            .fields
            .iter()
            .filter(|(_, f)| f.table.as_deref().is_some_and(|t| table_ref.matches(t)))
            .map(|(k, f)| (k.clone(), f.clone()))
            .collect();
        let related_joins: BTreeMap<String, JoinUsage> = digest
            .joins
            .iter()
            .filter(|(_, j)| table_ref.matches(&j.table1) || table_ref.matches(&j.table2))
            .map(|(k, j)| (k.clone(), j.clone()))
            .collect();

        let total = digest.usage_count.max(1);
        let percentage = usage.query_count as f64 / total as f64 * 100.0;

        let (mut row_count, mut column_count) = (usage.row_count, usage.column_count);
        if row_count.is_none() || column_count.is_none() {
            if let Ok(Some(stats)) = self.catalog.table_stats(&table_ref).await {
                row_count = row_count.or(Some(stats.row_count));
                column_count = column_count.or(Some(stats.column_count));
            }
        }

        let most_queried_fields =
            rank(related_fields.into_iter(), |f| f.query_count, 0, TOP_FIELDS);
        let common_joins = rank(related_joins.into_iter(), |j| j.query_count, 0, TOP_JOINS);

        let display_name = format!("{}.{}", usage.schema, usage.name);
        let description = describe(
            &display_name,
            &table_ref,
            usage.query_count,
            row_count,
            column_count,
            &most_queried_fields,
            &common_joins,
        );

        Ok(TableImportance {
            table_name: table_ref.qualified(),
            importance_metrics: ImportanceMetrics {
                query_count: usage.query_count,
                total_queries_analyzed: digest.usage_count,
                usage_percentage: round_to(percentage, 2),
                importance_score: round_to(percentage.min(10.0), 1),
                row_count,
                column_count,
                first_seen: Some(usage.first_seen),
                last_seen: Some(usage.last_seen),
            },
            most_queried_fields,
            common_joins,
            description,
        })
    }

    /// Importance of a table the digest has never seen
    async fn unqueried_importance(
        &self,
        table_ref: &TableRef,
        digest_total: u64,
    ) -> Result<TableImportance, DigestError> {
        let stats = self
            .catalog
            .table_stats(table_ref)
            .await?
            .ok_or_else(|| DigestError::TableNotFound(table_ref.qualified()))?;

        Ok(TableImportance {
            table_name: table_ref.qualified(),
            importance_metrics: ImportanceMetrics {
                query_count: 0,
                total_queries_analyzed: digest_total,
                usage_percentage: 0.0,
                importance_score: 0.0,
                row_count: Some(stats.row_count),
                column_count: Some(stats.column_count),
                first_seen: None,
                last_seen: None,
            },
            most_queried_fields: Vec::new(),
            common_joins: Vec::new(),
            description: describe(
                &table_ref.qualified(),
                table_ref,
                0,
                Some(stats.row_count),
                Some(stats.column_count),
                &[],
                &[],
            ),
        })
    }

    pub async fn suggest_joins(
        &self,
        table: &str,
        max_suggestions: usize,
    ) -> Result<JoinSuggestions, DigestError> {
        let table_ref = self.table_ref(table);
        if !self.catalog.table_exists(&table_ref).await? {
            return Err(DigestError::TableNotFound(table_ref.qualified()));
        }

        let digest = self.load().await?;
        let mut usage_candidates = Vec::new();
        for join in digest.joins.values() {
            let (primary, secondary) = if table_ref.matches(&join.table1) {
                (&join.table1, &join.table2)
            } else if table_ref.matches(&join.table2) {
                (&join.table2, &join.table1)
            } else {
                continue;
            };
            usage_candidates.push(Candidate {
                primary: primary.clone(),
                secondary: secondary.clone(),
                condition: join.join_fields.clone(),
                query_count: join.query_count,
                source: JoinSource::UsageHistory,
            });
        }

        let keys = self.catalog.foreign_keys(&table_ref).await?;
        let mut fk_candidates = Vec::new();
        for fk in keys.all() {
            let pk_side = fk.pk_table.qualified();
            let fk_side = fk.fk_table.qualified();
            let candidate = if pk_side.eq_ignore_ascii_case(&table_ref.qualified()) {
                Candidate {
                    condition: Some(format!(
                        "{pk_side}.{} = {fk_side}.{}",
                        fk.pk_column, fk.fk_column
                    )),
                    primary: pk_side,
                    secondary: fk_side,
                    query_count: 0,
                    source: JoinSource::ForeignKey,
                }
            } else {
                Candidate {
                    condition: Some(format!(
                        "{fk_side}.{} = {pk_side}.{}",
                        fk.fk_column, fk.pk_column
                    )),
                    primary: fk_side,
                    secondary: pk_side,
                    query_count: 0,
                    source: JoinSource::ForeignKey,
                }
            };
            fk_candidates.push(candidate);
        }

        let usage_count = usage_candidates.len();
        let fk_count = fk_candidates.len();
        let merged = self.dedupe(usage_candidates, fk_candidates);
        let total_found = merged.len();

        let mut sorted = merged;
        sorted.sort_by(|a, b| b.query_count.cmp(&a.query_count));

        let mut join_suggestions = Vec::new();
        for candidate in sorted.into_iter().take(max_suggestions) {
            join_suggestions.push(self.build_suggestion(candidate).await);
        }

        tracing::info!(
            "Generated {} join suggestions for {}",
            join_suggestions.len(),
            table_ref
        );

        Ok(JoinSuggestions {
            table_name: table_ref.qualified(),
            join_suggestions,
            metadata: JoinSuggestionMetadata {
                max_suggestions,
                total_suggestions_found: total_found,
                usage_based_suggestions: usage_count,
                foreign_key_suggestions: fk_count,
            },
        })
    }

    /// Collapse candidates sharing an endpoint pair, preferring observed conditions
    fn dedupe(&self, usage: Vec<Candidate>, foreign: Vec<Candidate>) -> Vec<Candidate> {
        let pair = |c: &Candidate| {
            (
                self.table_ref(&c.primary).qualified().to_lowercase(),
                self.table_ref(&c.secondary).qualified().to_lowercase(),
            )
        };

        let mut merged: Vec<Candidate> = Vec::new();
        for candidate in usage.into_iter().chain(foreign) {
            let key = pair(&candidate);
            match merged.iter_mut().find(|existing| pair(existing) == key) {
                Some(existing) => {
                    existing.query_count = existing.query_count.max(candidate.query_count);
                    if existing.condition.is_none() {
                        existing.condition = candidate.condition;
                    }
                    if existing.source != candidate.source {
                        existing.source = JoinSource::Both;
                    }
                }
                None => merged.push(candidate),
            }
        }
        merged
    }

    /// Column names of a table; empty when the catalog cannot say
    async fn column_names(&self, table: &TableRef) -> Vec<String> {
        self.catalog
            .columns(table)
            .await
            .map(|cols| cols.into_iter().map(|c| c.name).collect())
            .unwrap_or_default()
    }

    async fn build_suggestion(&self, candidate: Candidate) -> JoinSuggestion {
        let primary = self.table_ref(&candidate.primary);
        let secondary = self.table_ref(&candidate.secondary);
        let secondary_columns = self.column_names(&secondary).await;

        let condition = match candidate.condition {
            Some(condition) => condition,
            None => {
                let primary_columns = self.column_names(&primary).await;
                infer_condition(&primary, &secondary, &primary_columns, &secondary_columns)
            }
        };

        // SQLite only accepts `table.*`, not `schema.table.*`
        let projection = if secondary_columns.is_empty() {
            format!("{}.*", secondary.name)
        } else {
            secondary_columns
                .iter()
                .take(EXAMPLE_COLUMNS)
                .map(|col| format!("{}.{}", secondary.qualified(), col))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let example_query = format!(
            "SELECT {}.*, {}\nFROM {}\nJOIN {} ON {}",
            primary.name,
            projection,
            primary.qualified(),
            secondary.qualified(),
            condition
        );

        JoinSuggestion {
            primary_table: candidate.primary,
            secondary_table: candidate.secondary,
            join_condition: condition,
            query_count: candidate.query_count,
            source: candidate.source,
            example_query,
        }
    }

    // ==================== Export ====================

    /// Export the stored digest, defaulting to a timestamped file next to it
    pub async fn export(
        &self,
        format: ExportFormat,
        path: Option<&Path>,
    ) -> Result<Vec<PathBuf>, DigestError> {
        let now = Utc::now();
        let target = match path {
            Some(path) => path.to_path_buf(),
            None => default_export_path(self.store.path(), format, now),
        };
        let store = self.store.clone();
        blocking(move || export(&store.load(), format, &target, now)).await
    }
}

/// Guess a join condition from column naming
fn infer_condition(
    primary: &TableRef,
    secondary: &TableRef,
    primary_columns: &[String],
    secondary_columns: &[String],
) -> String {
    let p = primary.qualified();
    let s = secondary.qualified();
    let primary_lower: Vec<String> = primary_columns.iter().map(|c| c.to_lowercase()).collect();
    let secondary_lower: Vec<String> = secondary_columns.iter().map(|c| c.to_lowercase()).collect();

    if let Some(shared) = primary_lower.iter().find(|col| secondary_lower.contains(col)) {
        return format!("{p}.{shared} = {s}.{shared}");
    }

    for pri in &primary_lower {
        for sec in &secondary_lower {
            if pri.ends_with(&format!("_{sec}")) || sec.ends_with(&format!("_{pri}")) {
                return format!("{p}.{pri} = {s}.{sec}");
            }
        }
    }

    format!("{p}.id = {s}.{}_id", primary.name)
}

/// Plain-language summary of a table's usage
fn describe(
    display_name: &str,
    table: &TableRef,
    query_count: u64,
    row_count: Option<u64>,
    column_count: Option<usize>,
    fields: &[Ranked<FieldUsage>],
    joins: &[Ranked<JoinUsage>],
) -> String {
    if query_count == 0 {
        return format!("The table {display_name} has not been queried or analyzed yet.");
    }

    let mut description = format!(
        "The table {display_name} contains approximately {} rows with {} columns. \
         It has been queried {} times in the analyzed history.",
        with_thousands(row_count.unwrap_or(0)),
        column_count.unwrap_or(0),
        with_thousands(query_count)
    );

    if !fields.is_empty() {
        let names: Vec<&str> = fields
            .iter()
            .take(DESCRIBED_FIELDS)
            .map(|f| f.usage.name.as_str())
            .collect();
        description.push_str(&format!(
            " The most commonly queried fields are {}.",
            names.join(", ")
        ));
    }

    if !joins.is_empty() {
        let partners: Vec<&str> = joins
            .iter()
            .take(DESCRIBED_JOINS)
            .map(|j| {
                if table.matches(&j.usage.table1) {
                    j.usage.table2.as_str()
                } else {
                    j.usage.table1.as_str()
                }
            })
            .collect();
        description.push_str(&format!(
            " This table is commonly joined with {}.",
            partners.join(", ")
        ));
    }

    description
}
