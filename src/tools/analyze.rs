//! Data profiling tools: per-column statistics and duplicate detection

use super::schema::existing_table;
use super::{parse_args, schema_of, Tool, ToolContext, ToolError};
use crate::db::ColumnInfo;
use crate::safety::{quote_ident, with_row_limit, TableRef};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Map, Value};

const DEFAULT_SAMPLE_SIZE: usize = 1000;
const TOP_VALUES: usize = 10;

/// How a declared column type is profiled, following SQLite affinity rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ColumnKind {
    Text,
    Numeric,
    Temporal,
    Other,
}

impl ColumnKind {
    pub(super) fn of(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        let has = |needle: &str| upper.contains(needle);

        if has("DATE") || has("TIME") {
            ColumnKind::Temporal
        } else if has("INT") {
            ColumnKind::Numeric
        } else if has("CHAR") || has("CLOB") || has("TEXT") {
            ColumnKind::Text
        } else if upper.is_empty() || has("BLOB") {
            ColumnKind::Other
        } else {
            ColumnKind::Numeric
        }
    }

    fn label(self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Numeric => "numeric",
            ColumnKind::Temporal => "temporal",
            ColumnKind::Other => "other",
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AnalyzeArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
    #[schemars(description = "Columns to analyze (default: all)")]
    column_names: Option<Vec<String>>,
    #[schemars(description = "Rows to analyze; 0 analyzes the whole table (default: 1000)")]
    sample_size: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DuplicateArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
    #[schemars(description = "Columns whose combined values identify a duplicate")]
    column_names: Vec<String>,
    #[schemars(description = "Rows to scan; 0 scans the whole table (default: 1000)")]
    sample_size: Option<usize>,
    #[schemars(description = "Smallest group size reported (default: 2)")]
    min_duplicates: Option<u64>,
}

/// Pick the requested columns out of the table's, in request order
fn select_columns<'a>(
    ctx: &ToolContext,
    columns: &'a [ColumnInfo],
    requested: &[String],
) -> Result<Vec<&'a ColumnInfo>, ToolError> {
    let mut selected = Vec::new();
    let mut unknown = Vec::new();
    for raw in requested {
        let name = ctx.policy.resolve_column(raw)?;
        match columns.iter().find(|c| c.name.eq_ignore_ascii_case(&name)) {
            Some(column) => selected.push(column),
            None => unknown.push(name),
        }
    }

    if !unknown.is_empty() {
        return Err(ToolError::Validation(format!(
            "Invalid column names: {}",
            unknown.join(", ")
        )));
    }
    Ok(selected)
}

/// The first `sample_size` rows of a table; every row when it is 0
fn sample_query(ctx: &ToolContext, table: &TableRef, sample_size: usize) -> String {
    let all = format!("SELECT * FROM {}", table.quoted());
    with_row_limit(&all, sample_size, ctx.executor.limit_syntax())
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0 * 100.0).round() / 100.0
}

fn round2(value: &Value) -> Value {
    value
        .as_f64()
        .map(|v| json!((v * 100.0).round() / 100.0))
        .unwrap_or(Value::Null)
}

async fn first_row(ctx: &ToolContext, sql: &str) -> Result<Map<String, Value>, ToolError> {
    let output = ctx.executor.query(sql, &[], Some(1)).await?;
    Ok(output.rows.into_iter().next().unwrap_or_default())
}

async fn count(ctx: &ToolContext, sql: &str) -> Result<u64, ToolError> {
    Ok(ctx
        .executor
        .query_scalar(sql, &[])
        .await?
        .and_then(|v| v.as_u64())
        .unwrap_or(0))
}

async fn profile_column(
    ctx: &ToolContext,
    source: &str,
    column: &ColumnInfo,
    analyzed: u64,
) -> Result<Value, ToolError> {
    let col = quote_ident(&column.name);
    let kind = ColumnKind::of(&column.data_type);

    let basics = first_row(
        ctx,
        &format!(
            "SELECT COUNT(*) - COUNT({col}) AS null_count, \
             COUNT(DISTINCT {col}) AS distinct_values FROM {source}"
        ),
    )
    .await?;
    let null_count = basics.get("null_count").and_then(Value::as_u64).unwrap_or(0);

    let mut profile = json!({
        "data_type": column.data_type,
        "kind": kind.label(),
        "null_count": null_count,
        "null_percentage": percentage(null_count, analyzed),
        "distinct_values": basics.get("distinct_values").cloned().unwrap_or(json!(0)),
    });

    match kind {
        ColumnKind::Text => {
            let top = ctx
                .executor
                .query(
                    &format!(
                        "SELECT {col} AS value, COUNT(*) AS frequency FROM {source} \
                         WHERE {col} IS NOT NULL GROUP BY {col} \
                         ORDER BY frequency DESC, value"
                    ),
                    &[],
                    Some(TOP_VALUES),
                )
                .await?;
            let top_values: Vec<Value> = top
                .rows
                .iter()
                .map(|row| {
                    let frequency = row.get("frequency").and_then(Value::as_u64).unwrap_or(0);
                    json!({
                        "value": row.get("value").cloned().unwrap_or(Value::Null),
                        "frequency": frequency,
                        "percentage": percentage(frequency, analyzed),
                    })
                })
                .collect();

            let lengths = first_row(
                ctx,
                &format!(
                    "SELECT MIN(LENGTH({col})) AS min, MAX(LENGTH({col})) AS max, \
                     AVG(LENGTH({col})) AS avg FROM {source}"
                ),
            )
            .await?;
            profile["top_values"] = json!(top_values);
            profile["length_stats"] = json!({
                "min": lengths.get("min").cloned().unwrap_or(Value::Null),
                "max": lengths.get("max").cloned().unwrap_or(Value::Null),
                "avg": lengths.get("avg").map(round2).unwrap_or(Value::Null),
            });
        }
        ColumnKind::Numeric => {
            let stats = first_row(
                ctx,
                &format!(
                    "SELECT MIN({col}) AS min, MAX({col}) AS max, \
                     AVG({col}) AS avg, SUM({col}) AS sum FROM {source}"
                ),
            )
            .await?;
            profile["numeric_stats"] = json!({
                "min": stats.get("min").cloned().unwrap_or(Value::Null),
                "max": stats.get("max").cloned().unwrap_or(Value::Null),
                "avg": stats.get("avg").map(round2).unwrap_or(Value::Null),
                "sum": stats.get("sum").cloned().unwrap_or(Value::Null),
            });
        }
        ColumnKind::Temporal => {
            let stats = first_row(
                ctx,
                &format!("SELECT MIN({col}) AS earliest, MAX({col}) AS latest FROM {source}"),
            )
            .await?;
            profile["date_stats"] = json!({
                "earliest": stats.get("earliest").cloned().unwrap_or(Value::Null),
                "latest": stats.get("latest").cloned().unwrap_or(Value::Null),
            });
        }
        ColumnKind::Other => {}
    }

    Ok(profile)
}

// ==================== analyze_table_data ====================

pub struct AnalyzeTableData;

#[async_trait::async_trait]
impl Tool for AnalyzeTableData {
    fn name(&self) -> &'static str {
        "analyze_table_data"
    }

    fn description(&self) -> &'static str {
        "Profile a table's columns: nulls, distinct values, top values and value ranges"
    }

    fn input_schema(&self) -> Value {
        schema_of::<AnalyzeArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: AnalyzeArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;
        let columns = ctx.catalog.columns(&table).await?;
        let selected = match &args.column_names {
            Some(requested) if !requested.is_empty() => select_columns(ctx, &columns, requested)?,
            _ => columns.iter().collect(),
        };

        let sample_size = args.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE);
        let source = format!("({}) AS sample", sample_query(ctx, &table, sample_size));
        let total_rows = count(ctx, &format!("SELECT COUNT(*) FROM {}", table.quoted())).await?;
        let analyzed = count(ctx, &format!("SELECT COUNT(*) FROM {source}")).await?;

        let mut column_analysis = Map::new();
        for column in selected {
            let profile = profile_column(ctx, &source, column, analyzed).await?;
            column_analysis.insert(column.name.clone(), profile);
        }

        tracing::info!(
            "Analyzed {} columns of {} over {} rows",
            column_analysis.len(),
            table,
            analyzed
        );
        Ok(json!({
            "table_name": table.qualified(),
            "total_rows": total_rows,
            "analyzed_rows": analyzed,
            "sample_size": sample_size,
            "column_analysis": column_analysis,
        }))
    }
}

// ==================== find_duplicate_records ====================

pub struct FindDuplicateRecords;

const GROUP_SIZE: &str = "tablescope_group_size";

#[async_trait::async_trait]
impl Tool for FindDuplicateRecords {
    fn name(&self) -> &'static str {
        "find_duplicate_records"
    }

    fn description(&self) -> &'static str {
        "Find groups of rows that share the same values in the given columns"
    }

    fn input_schema(&self) -> Value {
        schema_of::<DuplicateArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: DuplicateArgs = parse_args(args)?;
        if args.column_names.is_empty() {
            return Err(ToolError::Validation(
                "column_names must name at least one column".into(),
            ));
        }
        let table = existing_table(ctx, &args.table_name).await?;
        let columns = ctx.catalog.columns(&table).await?;
        let checked = select_columns(ctx, &columns, &args.column_names)?;
        let min_duplicates = args.min_duplicates.unwrap_or(2).max(2);
        let sample_size = args.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE);

        let keys: Vec<String> = checked.iter().map(|c| quote_ident(&c.name)).collect();
        let mut primary: Vec<&ColumnInfo> = columns
            .iter()
            .filter(|c| c.primary_key.is_some())
            .filter(|c| !checked.iter().any(|k| k.name == c.name))
            .collect();
        primary.sort_by_key(|c| c.primary_key);
        let shown: Vec<String> = primary
            .iter()
            .chain(checked.iter())
            .map(|c| format!("s.{}", quote_ident(&c.name)))
            .collect();
        let joined_on: Vec<String> = keys.iter().map(|k| format!("s.{k} IS g.{k}")).collect();
        let order_by: Vec<String> = keys
            .iter()
            .map(|k| format!("s.{k}"))
            .chain(primary.iter().map(|c| format!("s.{}", quote_ident(&c.name))))
            .collect();

        let sql = format!(
            "WITH s AS ({sample}), \
             g AS (SELECT {keys}, COUNT(*) AS {GROUP_SIZE} FROM s \
             GROUP BY {keys} HAVING COUNT(*) >= ?) \
             SELECT g.{GROUP_SIZE}, {shown} FROM s JOIN g ON {joined_on} \
             ORDER BY g.{GROUP_SIZE} DESC, {order_by}",
            sample = sample_query(ctx, &table, sample_size),
            keys = keys.join(", "),
            shown = shown.join(", "),
            joined_on = joined_on.join(" AND "),
            order_by = order_by.join(", "),
        );
        let output = ctx
            .executor
            .query(&sql, &[json!(min_duplicates)], Some(ctx.max_rows))
            .await?;

        // Rows arrive grouped by key, so each group is a consecutive run
        let mut groups: Vec<(Map<String, Value>, u64, Vec<Value>)> = Vec::new();
        for mut row in output.rows {
            let size = row.remove(GROUP_SIZE).and_then(|v| v.as_u64()).unwrap_or(0);
            let key: Map<String, Value> = checked
                .iter()
                .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
                .collect();
            match groups.last_mut() {
                Some((last, _, records)) if *last == key => records.push(Value::Object(row)),
                _ => groups.push((key, size, vec![Value::Object(row)])),
            }
        }

        let duplicate_groups: Vec<Value> = groups
            .into_iter()
            .map(|(key_values, size, records)| {
                json!({
                    "key_values": key_values,
                    "duplicate_count": size,
                    "records": records,
                })
            })
            .collect();

        let mut result = json!({
            "table_name": table.qualified(),
            "columns_checked": checked.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "sample_size": sample_size,
            "duplicate_groups_found": duplicate_groups.len(),
            "duplicate_groups": duplicate_groups,
            "truncated": output.truncated,
        });
        if duplicate_groups.is_empty() {
            result["message"] = json!("No duplicate records found");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::test_context;

    #[test]
    fn test_column_kind_follows_affinity() {
        assert_eq!(ColumnKind::of("INTEGER"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::of("varchar(40)"), ColumnKind::Text);
        assert_eq!(ColumnKind::of("REAL"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::of("DECIMAL(10,2)"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::of("DATETIME"), ColumnKind::Temporal);
        assert_eq!(ColumnKind::of("BLOB"), ColumnKind::Other);
        assert_eq!(ColumnKind::of(""), ColumnKind::Other);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(2, 2), 100.0);
    }

    #[tokio::test]
    async fn test_analyze_text_and_numeric_columns() {
        let (_dir, ctx) = test_context().await;

        let customers = AnalyzeTableData
            .call(&ctx, json!({"table_name": "customers", "column_names": ["email"]}))
            .await
            .unwrap();
        assert_eq!(customers["total_rows"], 3);
        assert_eq!(customers["analyzed_rows"], 3);
        let email = &customers["column_analysis"]["email"];
        assert_eq!(email["kind"], "text");
        assert_eq!(email["null_count"], 1);
        assert_eq!(email["null_percentage"], 33.33);
        assert_eq!(email["distinct_values"], 2);
        assert_eq!(email["top_values"].as_array().unwrap().len(), 2);
        assert_eq!(email["top_values"][0]["value"], "ada@example.com");
        assert_eq!(email["length_stats"]["min"], 15);
        assert_eq!(email["length_stats"]["max"], 17);

        let orders = AnalyzeTableData
            .call(&ctx, json!({"table_name": "orders", "column_names": ["total"]}))
            .await
            .unwrap();
        let total = &orders["column_analysis"]["total"]["numeric_stats"];
        assert_eq!(total["min"], 20.5);
        assert_eq!(total["max"], 250.0);
        assert_eq!(total["sum"], 369.5);
        assert_eq!(total["avg"], 123.17);
    }

    #[tokio::test]
    async fn test_analyze_samples_rows() {
        let (_dir, ctx) = test_context().await;

        let sampled = AnalyzeTableData
            .call(&ctx, json!({"table_name": "orders", "sample_size": 2}))
            .await
            .unwrap();
        assert_eq!(sampled["total_rows"], 3);
        assert_eq!(sampled["analyzed_rows"], 2);
        assert_eq!(sampled["column_analysis"].as_object().unwrap().len(), 4);
        assert_eq!(sampled["column_analysis"]["note"]["kind"], "other");

        let everything = AnalyzeTableData
            .call(&ctx, json!({"table_name": "orders", "sample_size": 0}))
            .await
            .unwrap();
        assert_eq!(everything["analyzed_rows"], 3);
    }

    #[tokio::test]
    async fn test_analyze_rejects_unknown_columns() {
        let (_dir, ctx) = test_context().await;
        let err = AnalyzeTableData
            .call(
                &ctx,
                json!({"table_name": "customers", "column_names": ["name", "shoe_size"]}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert_eq!(err.to_string(), "Invalid column names: shoe_size");
    }

    #[tokio::test]
    async fn test_find_duplicate_records() {
        let (_dir, ctx) = test_context().await;
        let result = FindDuplicateRecords
            .call(&ctx, json!({"table_name": "orders", "column_names": ["customer_id"]}))
            .await
            .unwrap();

        assert_eq!(result["columns_checked"], json!(["customer_id"]));
        assert_eq!(result["duplicate_groups_found"], 1);
        let group = &result["duplicate_groups"][0];
        assert_eq!(group["key_values"], json!({"customer_id": 1}));
        assert_eq!(group["duplicate_count"], 2);
        assert_eq!(
            group["records"],
            json!([{"id": 1, "customer_id": 1}, {"id": 2, "customer_id": 1}])
        );
        assert!(result.get("message").is_none());
    }

    #[tokio::test]
    async fn test_find_duplicate_records_none_found() {
        let (_dir, ctx) = test_context().await;

        let unique = FindDuplicateRecords
            .call(&ctx, json!({"table_name": "customers", "column_names": ["name"]}))
            .await
            .unwrap();
        assert_eq!(unique["duplicate_groups_found"], 0);
        assert_eq!(unique["message"], "No duplicate records found");

        let strict = FindDuplicateRecords
            .call(
                &ctx,
                json!({
                    "table_name": "orders",
                    "column_names": ["customer_id"],
                    "min_duplicates": 3
                }),
            )
            .await
            .unwrap();
        assert_eq!(strict["duplicate_groups_found"], 0);

        let empty = FindDuplicateRecords
            .call(&ctx, json!({"table_name": "orders", "column_names": []}))
            .await
            .unwrap_err();
        assert_eq!(empty.code(), "validation_error");
    }
}
