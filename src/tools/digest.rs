//! Usage digest tools

use super::{parse_args, schema_of, to_value, Tool, ToolContext, ToolError};
use crate::digest::ExportFormat;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

const DEFAULT_MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Deserialize, JsonSchema)]
struct GetDigestArgs {
    #[schemars(description = "Minimum query count to include an entry (default from config)")]
    min_query_count: Option<u64>,
    #[schemars(description = "Maximum entries per section (default from config)")]
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct UpdateDigestArgs {
    #[schemars(description = "Refresh even if the digest was updated recently")]
    force_update: Option<bool>,
    #[schemars(description = "Days of query history to analyze (default from config)")]
    days_history: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ImportanceArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SuggestJoinsArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
    #[schemars(description = "Maximum number of suggestions (default: 5)")]
    max_suggestions: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExportArgs {
    #[schemars(description = "Output format: csv, json or xml (default: json)")]
    format: Option<ExportFormat>,
    #[schemars(
        description = "Output file; csv writes three files derived from its stem. Defaults to a timestamped file in the exports directory"
    )]
    output_path: Option<PathBuf>,
}

// ==================== get_usage_digest ====================

pub struct GetUsageDigest;

#[async_trait::async_trait]
impl Tool for GetUsageDigest {
    fn name(&self) -> &'static str {
        "get_usage_digest"
    }

    fn description(&self) -> &'static str {
        "Most frequently queried tables, fields and joins"
    }

    fn input_schema(&self) -> Value {
        schema_of::<GetDigestArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: GetDigestArgs = parse_args(args)?;
        let min = args
            .min_query_count
            .unwrap_or(ctx.digest_settings.min_query_count);
        let max = args.max_results.unwrap_or(ctx.digest_settings.max_results);

        to_value(&ctx.digest.view(min, max).await?)
    }
}

// ==================== update_usage_digest ====================

pub struct UpdateUsageDigest;

#[async_trait::async_trait]
impl Tool for UpdateUsageDigest {
    fn name(&self) -> &'static str {
        "update_usage_digest"
    }

    fn description(&self) -> &'static str {
        "Analyze recent query history and merge it into the usage digest"
    }

    fn input_schema(&self) -> Value {
        schema_of::<UpdateDigestArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: UpdateDigestArgs = parse_args(args)?;
        let outcome = ctx
            .digest
            .refresh(args.force_update.unwrap_or(false), args.days_history)
            .await?;
        to_value(&outcome)
    }
}

// ==================== get_table_importance ====================

pub struct GetTableImportance;

#[async_trait::async_trait]
impl Tool for GetTableImportance {
    fn name(&self) -> &'static str {
        "get_table_importance"
    }

    fn description(&self) -> &'static str {
        "How heavily a table is used, its hot fields and joins, with a short description"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ImportanceArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: ImportanceArgs = parse_args(args)?;
        let table = ctx.policy.resolve_table(&args.table_name)?;
        to_value(&ctx.digest.table_importance(&table.qualified()).await?)
    }
}

// ==================== suggest_important_joins ====================

pub struct SuggestImportantJoins;

#[async_trait::async_trait]
impl Tool for SuggestImportantJoins {
    fn name(&self) -> &'static str {
        "suggest_important_joins"
    }

    fn description(&self) -> &'static str {
        "Suggest joins for a table from observed usage and foreign keys, with example queries"
    }

    fn input_schema(&self) -> Value {
        schema_of::<SuggestJoinsArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: SuggestJoinsArgs = parse_args(args)?;
        let table = ctx.policy.resolve_table(&args.table_name)?;
        let max = args.max_suggestions.unwrap_or(DEFAULT_MAX_SUGGESTIONS);
        to_value(&ctx.digest.suggest_joins(&table.qualified(), max).await?)
    }
}

// ==================== export_usage_report ====================

pub struct ExportUsageReport;

#[async_trait::async_trait]
impl Tool for ExportUsageReport {
    fn name(&self) -> &'static str {
        "export_usage_report"
    }

    fn description(&self) -> &'static str {
        "Export the usage digest as csv, json or xml"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ExportArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: ExportArgs = parse_args(args)?;
        let format = args.format.unwrap_or(ExportFormat::Json);
        let paths = ctx
            .digest
            .export(format, args.output_path.as_deref())
            .await?;

        tracing::info!("Exported usage report to {} file(s)", paths.len());
        Ok(json!({
            "status": "success",
            "message": format!("Usage report exported as {}", format.extension()),
            "output_paths": paths,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::test_context;
    use chrono::Utc;

    const JOIN_QUERY: &str =
        "SELECT c.name, o.total FROM customers c JOIN orders o ON c.id = o.customer_id";

    async fn seeded_context() -> (tempfile::TempDir, ToolContext) {
        let (dir, ctx) = test_context().await;
        let log = ctx.history_log.as_ref().unwrap();
        for _ in 0..3 {
            log.record(JOIN_QUERY, Utc::now()).unwrap();
        }
        log.record("SELECT name FROM pragma_table_info('orders')", Utc::now())
            .unwrap();
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_refresh_then_read_digest() {
        let (_dir, ctx) = seeded_context().await;

        let outcome = UpdateUsageDigest.call(&ctx, json!({})).await.unwrap();
        assert_eq!(outcome["status"], "success");
        assert_eq!(outcome["queries_analyzed"], 1);

        let again = UpdateUsageDigest.call(&ctx, json!({})).await.unwrap();
        assert_eq!(again["status"], "skipped");

        let forced = UpdateUsageDigest
            .call(&ctx, json!({"force_update": true}))
            .await
            .unwrap();
        assert_eq!(forced["status"], "success");

        let digest = GetUsageDigest.call(&ctx, json!({})).await.unwrap();
        assert_eq!(digest["usage_count"], 2);
        let customers = digest["tables"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["key"] == "customers")
            .unwrap();
        assert_eq!(customers["query_count"], 6);
    }

    #[tokio::test]
    async fn test_refresh_without_history_is_not_found() {
        let (_dir, ctx) = test_context().await;
        let err = UpdateUsageDigest.call(&ctx, json!({})).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_refresh_rejects_window_past_date_range() {
        let (_dir, ctx) = seeded_context().await;
        let err = UpdateUsageDigest
            .call(&ctx, json!({"force_update": true, "days_history": u32::MAX}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains(&u32::MAX.to_string()));
    }

    #[tokio::test]
    async fn test_table_importance_and_joins() {
        let (_dir, ctx) = seeded_context().await;
        UpdateUsageDigest.call(&ctx, json!({})).await.unwrap();

        let importance = GetTableImportance
            .call(&ctx, json!({"table_name": "customers"}))
            .await
            .unwrap();
        assert_eq!(importance["importance_metrics"]["query_count"], 3);
        assert!(importance["description"].as_str().unwrap().contains("customers"));

        let joins = SuggestImportantJoins
            .call(&ctx, json!({"table_name": "customers", "max_suggestions": 2}))
            .await
            .unwrap();
        let suggestions = joins["join_suggestions"].as_array().unwrap();
        assert!(!suggestions.is_empty());
        assert!(suggestions.len() <= 2);
        assert!(suggestions[0]["secondary_table"]
            .as_str()
            .unwrap()
            .contains("orders"));
    }

    #[tokio::test]
    async fn test_table_tools_enforce_allow_list() {
        let (_dir, ctx) = test_context().await;
        let err = GetTableImportance
            .call(&ctx, json!({"table_name": "temp.scratch"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");

        let missing = SuggestImportantJoins
            .call(&ctx, json!({"table_name": "nope"}))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "not_found");
    }

    #[tokio::test]
    async fn test_export_report() {
        let (dir, ctx) = seeded_context().await;
        UpdateUsageDigest.call(&ctx, json!({})).await.unwrap();

        let target = dir.path().join("report.csv");
        let result = ExportUsageReport
            .call(&ctx, json!({"format": "csv", "output_path": target}))
            .await
            .unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["output_paths"].as_array().unwrap().len(), 3);

        let default = ExportUsageReport.call(&ctx, Value::Null).await.unwrap();
        let path = default["output_paths"][0].as_str().unwrap();
        assert!(path.ends_with(".json"));
        assert!(std::path::Path::new(path).exists());
    }

    #[tokio::test]
    async fn test_export_rejects_unknown_format() {
        let (_dir, ctx) = test_context().await;
        let err = ExportUsageReport
            .call(&ctx, json!({"format": "yaml"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
