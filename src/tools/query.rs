//! Read-only query tools

use super::builder::SelectBuilder;
use super::schema::existing_table;
use super::{parse_args, schema_of, Tool, ToolContext, ToolError};
use crate::db::QueryOutput;
use crate::safety::{self, with_row_limit};
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Instant;

const DEFAULT_SAMPLE_SIZE: usize = 10;
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecuteSelectArgs {
    #[schemars(description = "A single SELECT statement")]
    query: String,
    #[schemars(description = "Maximum rows to return (capped by the server's max_rows)")]
    limit: Option<usize>,
    #[schemars(description = "Positional values for ? placeholders")]
    parameters: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SampleArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
    #[schemars(description = "Number of rows to sample (default: 10)")]
    sample_size: Option<usize>,
    #[schemars(description = "Optional WHERE condition, without the WHERE keyword")]
    #[serde(rename = "where")]
    where_clause: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExplainArgs {
    #[schemars(description = "The SELECT statement to explain")]
    query: String,
    #[schemars(description = "Positional values for ? placeholders")]
    parameters: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryTableArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
    #[schemars(description = "Columns to return (default: all)")]
    columns: Option<Vec<String>>,
    #[schemars(
        description = "Filters keyed by column with an optional operator suffix, e.g. {\"status\": \"active\", \"total >=\": 10, \"id IN\": [1, 2], \"note IS NOT\": null}"
    )]
    filters: Option<Map<String, Value>>,
    #[schemars(description = "Column to sort by")]
    order_by: Option<String>,
    #[schemars(description = "Sort descending (default: false)")]
    order_desc: Option<bool>,
    #[schemars(description = "Maximum rows to return (default: 100)")]
    limit: Option<usize>,
    #[schemars(description = "Rows to skip, for paging (default: 0)")]
    offset: Option<usize>,
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "unknown",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "real",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) | Value::Object(_) => "json",
    }
}

/// Column names with a type guessed from the first non-null value
fn column_metadata(output: &QueryOutput) -> Vec<Value> {
    output
        .columns
        .iter()
        .map(|name| {
            let sample = output
                .rows
                .iter()
                .filter_map(|row| row.get(name))
                .find(|value| !value.is_null())
                .unwrap_or(&Value::Null);
            json!({ "name": name, "type": value_type(sample) })
        })
        .collect()
}

fn elapsed_ms(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0 * 1000.0).round() / 1000.0
}

// ==================== execute_select ====================

pub struct ExecuteSelect;

#[async_trait::async_trait]
impl Tool for ExecuteSelect {
    fn name(&self) -> &'static str {
        "execute_select"
    }

    fn description(&self) -> &'static str {
        "Run a read-only SELECT statement with a bounded row count"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ExecuteSelectArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: ExecuteSelectArgs = parse_args(args)?;
        safety::check(&args.query)?;

        let limit = ctx.row_cap(args.limit);
        let sql = with_row_limit(&args.query, limit, ctx.executor.limit_syntax());
        let params = args.parameters.unwrap_or_default();

        let start = Instant::now();
        let output = ctx.executor.query(&sql, &params, Some(limit)).await?;
        let execution_time_ms = elapsed_ms(start);

        tracing::info!(
            "Query returned {} rows in {:.3}ms",
            output.rows.len(),
            execution_time_ms
        );

        if let Some(log) = ctx.history_log.clone() {
            let query = args.query.clone();
            let recorded =
                tokio::task::spawn_blocking(move || log.record(&query, Utc::now())).await;
            match recorded {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Failed to record query history: {}", e),
                Err(e) => tracing::warn!("Query history task failed: {}", e),
            }
        }

        let row_count = output.rows.len();
        Ok(json!({
            "success": true,
            "row_count": row_count,
            "columns": column_metadata(&output),
            "limited": output.truncated || row_count >= limit,
            "results": output.rows,
            "execution_time_ms": execution_time_ms,
            "limit": limit,
        }))
    }
}

// ==================== get_sample_data ====================

pub struct GetSampleData;

#[async_trait::async_trait]
impl Tool for GetSampleData {
    fn name(&self) -> &'static str {
        "get_sample_data"
    }

    fn description(&self) -> &'static str {
        "Fetch a few representative rows from a table, randomly ordered unless filtered"
    }

    fn input_schema(&self) -> Value {
        schema_of::<SampleArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: SampleArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;
        let sample_size = ctx.row_cap(Some(args.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE)));

        let base = format!("SELECT * FROM {}", table.quoted());
        let sql = match args.where_clause.as_deref().map(str::trim) {
            Some(condition) if !condition.is_empty() => {
                let filtered = format!("{base} WHERE {condition}");
                safety::check(&filtered).map_err(|r| {
                    ToolError::Validation(format!("WHERE clause rejected: {r}"))
                })?;
                filtered
            }
            _ => format!("{base} ORDER BY RANDOM()"),
        };
        let sql = with_row_limit(&sql, sample_size, ctx.executor.limit_syntax());

        let output = ctx.executor.query(&sql, &[], Some(sample_size)).await?;
        Ok(json!({
            "table_name": table.qualified(),
            "sample_size": sample_size,
            "row_count": output.rows.len(),
            "columns": column_metadata(&output),
            "rows": output.rows,
        }))
    }
}

// ==================== explain_query ====================

pub struct ExplainQuery;

/// Plan-derived hints for SQLite `EXPLAIN QUERY PLAN` detail lines
fn plan_suggestions(details: &[String]) -> Vec<String> {
    let mut suggestions = Vec::new();

    for detail in details {
        let upper = detail.to_ascii_uppercase();
        if upper.starts_with("SCAN ") && !upper.contains(" USING ") {
            if let Some(table) = detail.split_whitespace().nth(1) {
                suggestions.push(format!(
                    "Full table scan of {table}; an index on the filtered or joined columns may help"
                ));
            }
        }
        if upper.contains("USE TEMP B-TREE") {
            suggestions.push(format!(
                "{detail}: an index matching these columns would avoid the temporary sort"
            ));
        }
        if upper.contains("CORRELATED") {
            suggestions.push(format!(
                "{detail}: correlated subqueries run once per outer row; consider rewriting as a join"
            ));
        }
    }

    if suggestions.is_empty() {
        suggestions.push("No full scans or temporary sorts in this plan".to_string());
    }
    suggestions
}

#[async_trait::async_trait]
impl Tool for ExplainQuery {
    fn name(&self) -> &'static str {
        "explain_query"
    }

    fn description(&self) -> &'static str {
        "Show the query plan for a SELECT statement with optimization hints"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ExplainArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: ExplainArgs = parse_args(args)?;
        safety::check(&args.query)?;

        let sql = format!("EXPLAIN QUERY PLAN {}", args.query);
        let output = ctx
            .executor
            .query(&sql, &args.parameters.unwrap_or_default(), None)
            .await?;

        let plan: Vec<Value> = output
            .rows
            .iter()
            .map(|row| {
                json!({
                    "id": row.get("id").cloned().unwrap_or(Value::Null),
                    "parent": row.get("parent").cloned().unwrap_or(Value::Null),
                    "detail": row.get("detail").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        let details: Vec<String> = plan
            .iter()
            .filter_map(|step| step["detail"].as_str().map(String::from))
            .collect();

        Ok(json!({
            "query": args.query,
            "execution_plan": plan,
            "optimization_suggestions": plan_suggestions(&details),
        }))
    }
}

// ==================== query_table ====================

pub struct QueryTable;

#[async_trait::async_trait]
impl Tool for QueryTable {
    fn name(&self) -> &'static str {
        "query_table"
    }

    fn description(&self) -> &'static str {
        "Query a table with column selection, filters, sorting and paging, without writing SQL"
    }

    fn input_schema(&self) -> Value {
        schema_of::<QueryTableArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: QueryTableArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;
        let limit = ctx.row_cap(Some(args.limit.unwrap_or(DEFAULT_PAGE_SIZE)));
        let offset = args.offset.unwrap_or(0);
        let filters = args.filters.unwrap_or_default();

        let mut builder = SelectBuilder::new(table)
            .columns(args.columns.unwrap_or_default())?
            .filters(filters.clone())?
            .limit(limit)
            .offset(offset);
        if let Some(column) = &args.order_by {
            builder = builder.order_by(column, args.order_desc.unwrap_or(false))?;
        }

        let (sql, params) = builder.build();
        let start = Instant::now();
        let output = ctx.executor.query(&sql, &params, Some(limit)).await?;
        let execution_time_ms = elapsed_ms(start);

        let (count_sql, count_params) = builder.build_count();
        let total = ctx
            .executor
            .query_scalar(&count_sql, &count_params)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let row_count = output.rows.len();
        Ok(json!({
            "success": true,
            "table_name": builder.table().qualified(),
            "rows": output.rows,
            "row_count": row_count,
            "total_matching_rows": total,
            "has_more": ((offset + row_count) as u64) < total,
            "generated_sql": sql,
            "execution_time_ms": execution_time_ms,
            "filters_applied": filters,
            "limit": limit,
            "offset": offset,
        }))
    }
}
