//! Catalog tools: schemas, tables, columns, keys

use super::analyze::ColumnKind;
use super::{parse_args, schema_of, to_value, Tool, ToolContext, ToolError};
use crate::db::{ColumnInfo, ForeignKeyInfo, TableKind};
use crate::safety::{quote_ident, with_row_limit, TableRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Row cap written into example statements
const EXAMPLE_LIMIT: usize = 10;

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub(super) struct NoArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListTablesArgs {
    #[schemars(description = "Only list tables in this schema")]
    schema: Option<String>,
    #[schemars(description = "Include views (default: false)")]
    include_views: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TableArgs {
    #[schemars(description = "Table name, optionally qualified as schema.table")]
    table_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
enum ObjectType {
    #[serde(alias = "table")]
    Table,
    #[serde(alias = "view")]
    View,
    #[serde(alias = "column")]
    Column,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    #[schemars(description = "Case-insensitive substring to look for")]
    search_term: String,
    #[schemars(description = "Object types to search: TABLE, VIEW, COLUMN (default: all)")]
    object_types: Option<Vec<ObjectType>>,
}

/// A matching table or view
#[derive(Debug, Serialize)]
struct ObjectMatch {
    schema: String,
    name: String,
    qualified_name: String,
}

#[derive(Debug, Serialize)]
struct ColumnMatch {
    schema: String,
    table_name: String,
    column_name: String,
    data_type: String,
}

/// Resolve, allow-list and existence-check a table argument
pub(super) async fn existing_table(ctx: &ToolContext, raw: &str) -> Result<TableRef, ToolError> {
    let table = ctx.policy.resolve_table(raw)?;
    if !ctx.catalog.table_exists(&table).await? {
        return Err(ToolError::NotFound(format!("table {table} does not exist")));
    }
    Ok(table)
}

fn visible(ctx: &ToolContext, keys: Vec<ForeignKeyInfo>) -> Vec<ForeignKeyInfo> {
    keys.into_iter()
        .filter(|fk| {
            ctx.policy.is_allowed(&fk.fk_table.schema) && ctx.policy.is_allowed(&fk.pk_table.schema)
        })
        .collect()
}

// ==================== list_schemas ====================

pub struct ListSchemas;

#[async_trait::async_trait]
impl Tool for ListSchemas {
    fn name(&self) -> &'static str {
        "list_schemas"
    }

    fn description(&self) -> &'static str {
        "List the database schemas this server is allowed to read"
    }

    fn input_schema(&self) -> Value {
        schema_of::<NoArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let _: NoArgs = parse_args(args)?;
        let schemas: Vec<String> = ctx
            .catalog
            .schemas()
            .await?
            .into_iter()
            .filter(|schema| ctx.policy.is_allowed(schema))
            .collect();

        Ok(json!({ "schemas": schemas }))
    }
}

// ==================== list_tables ====================

pub struct ListTables;

#[async_trait::async_trait]
impl Tool for ListTables {
    fn name(&self) -> &'static str {
        "list_tables"
    }

    fn description(&self) -> &'static str {
        "List tables (and optionally views) with their column counts"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ListTablesArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: ListTablesArgs = parse_args(args)?;
        if let Some(schema) = &args.schema {
            ctx.policy.check_schema(schema)?;
        }

        let tables: Vec<_> = ctx
            .catalog
            .list_tables(args.schema.as_deref(), args.include_views.unwrap_or(false))
            .await?
            .into_iter()
            .filter(|table| ctx.policy.is_allowed(&table.schema))
            .collect();

        Ok(json!({
            "count": tables.len(),
            "tables": to_value(&tables)?,
        }))
    }
}

// ==================== get_table_schema ====================

pub struct GetTableSchema;

#[async_trait::async_trait]
impl Tool for GetTableSchema {
    fn name(&self) -> &'static str {
        "get_table_schema"
    }

    fn description(&self) -> &'static str {
        "Describe a table: columns, primary key, foreign keys and indexes"
    }

    fn input_schema(&self) -> Value {
        schema_of::<TableArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: TableArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;

        let columns = ctx.catalog.columns(&table).await?;
        let mut primary_key: Vec<_> = columns
            .iter()
            .filter_map(|c| c.primary_key.map(|pos| (pos, c.name.clone())))
            .collect();
        primary_key.sort();
        let primary_key: Vec<String> = primary_key.into_iter().map(|(_, name)| name).collect();

        let foreign_keys = visible(ctx, ctx.catalog.foreign_keys(&table).await?.outgoing);
        let indexes = ctx.catalog.indexes(&table).await?;

        Ok(json!({
            "table_name": table.qualified(),
            "columns": to_value(&columns)?,
            "primary_key": primary_key,
            "foreign_keys": to_value(&foreign_keys)?,
            "indexes": to_value(&indexes)?,
        }))
    }
}

// ==================== find_foreign_keys ====================

pub struct FindForeignKeys;

#[async_trait::async_trait]
impl Tool for FindForeignKeys {
    fn name(&self) -> &'static str {
        "find_foreign_keys"
    }

    fn description(&self) -> &'static str {
        "Find relationships from and to a table"
    }

    fn input_schema(&self) -> Value {
        schema_of::<TableArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: TableArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;
        let keys = ctx.catalog.foreign_keys(&table).await?;

        Ok(json!({
            "table": table.qualified(),
            "outgoing_relationships": to_value(&visible(ctx, keys.outgoing))?,
            "incoming_relationships": to_value(&visible(ctx, keys.incoming))?,
        }))
    }
}

// ==================== get_database_info ====================

pub struct GetDatabaseInfo;

#[async_trait::async_trait]
impl Tool for GetDatabaseInfo {
    fn name(&self) -> &'static str {
        "get_database_info"
    }

    fn description(&self) -> &'static str {
        "Report engine version, file, page statistics and connection pool health"
    }

    fn input_schema(&self) -> Value {
        schema_of::<NoArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let _: NoArgs = parse_args(args)?;
        let info = ctx.catalog.database_info().await?;

        let mut result = to_value(&info)?;
        if let Value::Object(map) = &mut result {
            map.insert(
                "allowed_schemas".to_string(),
                json!(ctx.policy.allowed_schemas()),
            );
            map.insert("max_rows".to_string(), json!(ctx.max_rows));
            map.insert(
                "pool".to_string(),
                to_value(&ctx.executor.pool_health())?,
            );
        }
        Ok(result)
    }
}

// ==================== search_schema_objects ====================

pub struct SearchSchemaObjects;

#[async_trait::async_trait]
impl Tool for SearchSchemaObjects {
    fn name(&self) -> &'static str {
        "search_schema_objects"
    }

    fn description(&self) -> &'static str {
        "Find tables, views and columns whose names contain a search term"
    }

    fn input_schema(&self) -> Value {
        schema_of::<SearchArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: SearchArgs = parse_args(args)?;
        let term = args.search_term.trim().to_lowercase();
        if term.is_empty() {
            return Err(ToolError::Validation("search_term must not be empty".into()));
        }
        let wanted = args
            .object_types
            .filter(|types| !types.is_empty())
            .unwrap_or_else(|| vec![ObjectType::Table, ObjectType::View, ObjectType::Column]);

        let objects: Vec<_> = ctx
            .catalog
            .list_tables(None, true)
            .await?
            .into_iter()
            .filter(|table| ctx.policy.is_allowed(&table.schema))
            .collect();

        let mut tables = Vec::new();
        let mut views = Vec::new();
        let mut columns = Vec::new();
        for object in &objects {
            let hit = object.name.to_lowercase().contains(&term)
                || object.schema.to_lowercase().contains(&term);
            let (kind, bucket) = match object.kind {
                TableKind::Table => (ObjectType::Table, &mut tables),
                TableKind::View => (ObjectType::View, &mut views),
            };
            if hit && wanted.contains(&kind) {
                bucket.push(ObjectMatch {
                    schema: object.schema.clone(),
                    name: object.name.clone(),
                    qualified_name: format!("{}.{}", object.schema, object.name),
                });
            }

            if wanted.contains(&ObjectType::Column) {
                let table = TableRef::new(object.schema.clone(), object.name.clone());
                for column in ctx.catalog.columns(&table).await? {
                    if column.name.to_lowercase().contains(&term) {
                        columns.push(ColumnMatch {
                            schema: object.schema.clone(),
                            table_name: object.name.clone(),
                            column_name: column.name,
                            data_type: column.data_type,
                        });
                    }
                }
            }
        }

        let total = tables.len() + views.len() + columns.len();
        Ok(json!({
            "search_term": args.search_term,
            "results": {
                "tables": to_value(&tables)?,
                "views": to_value(&views)?,
                "columns": to_value(&columns)?,
            },
            "total_matches": total,
        }))
    }
}

// ==================== find_related_tables ====================

pub struct FindRelatedTables;

/// One relationship seen from `table`
fn relationship(table: &TableRef, fk: &ForeignKeyInfo, outgoing: bool) -> Value {
    let condition = format!(
        "{}.{} = {}.{}",
        fk.fk_table.qualified(),
        fk.fk_column,
        fk.pk_table.qualified(),
        fk.pk_column
    );
    let (related, kind, description) = if outgoing {
        let related = fk.pk_table.qualified();
        let description = format!(
            "{} references {} through {}",
            table.qualified(),
            related,
            fk.fk_column
        );
        (related, "outgoing", description)
    } else {
        let related = fk.fk_table.qualified();
        let description = format!(
            "{} is referenced by {} through {}",
            table.qualified(),
            related,
            fk.fk_column
        );
        (related, "incoming", description)
    };

    json!({
        "related_table": related,
        "relationship_type": kind,
        "join_condition": condition,
        "description": description,
        "constraint_id": fk.constraint_id,
    })
}

#[async_trait::async_trait]
impl Tool for FindRelatedTables {
    fn name(&self) -> &'static str {
        "find_related_tables"
    }

    fn description(&self) -> &'static str {
        "List the tables a table is related to through foreign keys, with join conditions"
    }

    fn input_schema(&self) -> Value {
        schema_of::<TableArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: TableArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;
        let keys = ctx.catalog.foreign_keys(&table).await?;

        let mut relationships: Vec<Value> = visible(ctx, keys.outgoing)
            .iter()
            .map(|fk| relationship(&table, fk, true))
            .collect();
        relationships.extend(
            visible(ctx, keys.incoming)
                .iter()
                .map(|fk| relationship(&table, fk, false)),
        );

        Ok(json!({
            "table_name": table.qualified(),
            "relationship_count": relationships.len(),
            "relationships": relationships,
        }))
    }
}

// ==================== get_query_examples ====================

pub struct GetQueryExamples;

/// Read-only statement templates for a table
fn query_examples(
    ctx: &ToolContext,
    table: &TableRef,
    columns: &[ColumnInfo],
    first_fk: Option<&ForeignKeyInfo>,
) -> Map<String, Value> {
    let from = table.quoted();
    let limited = |sql: String| with_row_limit(&sql, EXAMPLE_LIMIT, ctx.executor.limit_syntax());
    let mut examples = Map::new();

    examples.insert(
        "basic_select".into(),
        json!(limited(format!("SELECT * FROM {from}"))),
    );

    if columns.len() > 3 {
        let list: Vec<String> = columns
            .iter()
            .take(3)
            .map(|c| quote_ident(&c.name))
            .collect();
        examples.insert(
            "select_columns".into(),
            json!(limited(format!("SELECT {} FROM {from}", list.join(", ")))),
        );
    }

    let filter_column = columns
        .iter()
        .find(|c| c.primary_key.is_none())
        .or_else(|| columns.first());
    if let Some(column) = filter_column {
        examples.insert(
            "select_where".into(),
            json!(format!(
                "SELECT * FROM {from} WHERE {} = ?",
                quote_ident(&column.name)
            )),
        );
    }

    if let Some(first) = columns.first() {
        examples.insert(
            "select_order".into(),
            json!(limited(format!(
                "SELECT * FROM {from} ORDER BY {} DESC",
                quote_ident(&first.name)
            ))),
        );
    }

    let text = columns
        .iter()
        .find(|c| ColumnKind::of(&c.data_type) == ColumnKind::Text);
    let numeric = columns
        .iter()
        .find(|c| ColumnKind::of(&c.data_type) == ColumnKind::Numeric && c.primary_key.is_none());
    if let (Some(text), Some(numeric)) = (text, numeric) {
        let group = quote_ident(&text.name);
        let measure = quote_ident(&numeric.name);
        examples.insert(
            "select_group".into(),
            json!(format!(
                "SELECT {group}, COUNT(*) AS row_count, AVG({measure}) AS avg_value \
                 FROM {from} GROUP BY {group} ORDER BY row_count DESC"
            )),
        );
    }

    if let Some(fk) = first_fk {
        examples.insert(
            "select_join".into(),
            json!(limited(format!(
                "SELECT a.*, b.* FROM {from} AS a JOIN {} AS b ON a.{} = b.{}",
                fk.pk_table.quoted(),
                quote_ident(&fk.fk_column),
                quote_ident(&fk.pk_column)
            ))),
        );
    }

    examples.insert(
        "count_records".into(),
        json!(format!("SELECT COUNT(*) AS total_rows FROM {from}")),
    );
    examples
}

#[async_trait::async_trait]
impl Tool for GetQueryExamples {
    fn name(&self) -> &'static str {
        "get_query_examples"
    }

    fn description(&self) -> &'static str {
        "Example SELECT statements for a table built from its columns and keys"
    }

    fn input_schema(&self) -> Value {
        schema_of::<TableArgs>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: TableArgs = parse_args(args)?;
        let table = existing_table(ctx, &args.table_name).await?;
        let columns = ctx.catalog.columns(&table).await?;
        let outgoing = visible(ctx, ctx.catalog.foreign_keys(&table).await?.outgoing);

        let examples = query_examples(ctx, &table, &columns, outgoing.first());
        Ok(json!({
            "table_name": table.qualified(),
            "examples": examples,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::test_context;

    #[tokio::test]
    async fn test_list_schemas_filters_to_allowed() {
        let (_dir, ctx) = test_context().await;
        let result = ListSchemas.call(&ctx, json!({})).await.unwrap();
        assert_eq!(result["schemas"], json!(["main"]));
    }

    #[tokio::test]
    async fn test_list_tables() {
        let (_dir, ctx) = test_context().await;

        let result = ListTables.call(&ctx, json!({})).await.unwrap();
        assert_eq!(result["count"], 3);
        let names: Vec<_> = result["tables"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"customers".to_string()));
        assert!(!names.contains(&"big_orders".to_string()));

        let with_views = ListTables
            .call(&ctx, json!({"include_views": true}))
            .await
            .unwrap();
        assert_eq!(with_views["count"], 4);
    }

    #[tokio::test]
    async fn test_list_tables_rejects_foreign_schema() {
        let (_dir, ctx) = test_context().await;
        let err = ListTables
            .call(&ctx, json!({"schema": "temp"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn test_get_table_schema() {
        let (_dir, ctx) = test_context().await;
        let result = GetTableSchema
            .call(&ctx, json!({"table_name": "orders"}))
            .await
            .unwrap();

        assert_eq!(result["table_name"], "main.orders");
        assert_eq!(result["primary_key"], json!(["id"]));
        assert_eq!(result["columns"].as_array().unwrap().len(), 4);
        assert_eq!(result["foreign_keys"][0]["pk_table"]["name"], "customers");
        assert!(result["indexes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|idx| idx["name"] == "idx_orders_customer"));
    }

    #[tokio::test]
    async fn test_get_table_schema_errors() {
        let (_dir, ctx) = test_context().await;

        let missing = GetTableSchema
            .call(&ctx, json!({"table_name": "nope"}))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "not_found");

        let injected = GetTableSchema
            .call(&ctx, json!({"table_name": "orders; DROP TABLE orders"}))
            .await
            .unwrap_err();
        assert_eq!(injected.code(), "validation_error");

        let no_args = GetTableSchema.call(&ctx, json!({})).await.unwrap_err();
        assert_eq!(no_args.code(), "validation_error");
    }

    #[tokio::test]
    async fn test_find_foreign_keys_both_directions() {
        let (_dir, ctx) = test_context().await;
        let result = FindForeignKeys
            .call(&ctx, json!({"table_name": "main.orders"}))
            .await
            .unwrap();

        assert_eq!(result["table"], "main.orders");
        assert_eq!(result["outgoing_relationships"][0]["fk_column"], "customer_id");
        assert_eq!(
            result["incoming_relationships"][0]["fk_table"]["name"],
            "order_items"
        );
    }

    #[tokio::test]
    async fn test_database_info() {
        let (_dir, ctx) = test_context().await;
        let result = GetDatabaseInfo.call(&ctx, Value::Null).await.unwrap();
        assert_eq!(result["engine"], "sqlite");
        assert_eq!(result["allowed_schemas"], json!(["main"]));
        assert_eq!(result["pool"]["max_size"], 2);
        assert!(result["pool"]["queries_executed"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_search_schema_objects() {
        let (_dir, ctx) = test_context().await;

        let result = SearchSchemaObjects
            .call(&ctx, json!({"search_term": "ORDER"}))
            .await
            .unwrap();
        let tables: Vec<_> = result["results"]["tables"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["qualified_name"].as_str().unwrap())
            .collect();
        assert_eq!(tables, vec!["main.order_items", "main.orders"]);
        assert_eq!(result["results"]["views"][0]["name"], "big_orders");
        assert_eq!(result["results"]["columns"][0]["column_name"], "order_id");
        assert_eq!(result["total_matches"], 4);

        let columns_only = SearchSchemaObjects
            .call(&ctx, json!({"search_term": "email", "object_types": ["COLUMN"]}))
            .await
            .unwrap();
        assert_eq!(columns_only["total_matches"], 1);
        assert_eq!(columns_only["results"]["columns"][0]["table_name"], "customers");
        assert_eq!(columns_only["results"]["tables"], json!([]));
    }

    #[tokio::test]
    async fn test_search_schema_objects_validation() {
        let (_dir, ctx) = test_context().await;

        let blank = SearchSchemaObjects
            .call(&ctx, json!({"search_term": "  "}))
            .await
            .unwrap_err();
        assert_eq!(blank.code(), "validation_error");

        let bad_type = SearchSchemaObjects
            .call(&ctx, json!({"search_term": "x", "object_types": ["PROCEDURE"]}))
            .await
            .unwrap_err();
        assert_eq!(bad_type.code(), "validation_error");
    }

    #[tokio::test]
    async fn test_find_related_tables() {
        let (_dir, ctx) = test_context().await;
        let result = FindRelatedTables
            .call(&ctx, json!({"table_name": "orders"}))
            .await
            .unwrap();

        assert_eq!(result["table_name"], "main.orders");
        assert_eq!(result["relationship_count"], 2);

        let outgoing = &result["relationships"][0];
        assert_eq!(outgoing["relationship_type"], "outgoing");
        assert_eq!(outgoing["related_table"], "main.customers");
        assert_eq!(
            outgoing["join_condition"],
            "main.orders.customer_id = main.customers.id"
        );

        let incoming = &result["relationships"][1];
        assert_eq!(incoming["relationship_type"], "incoming");
        assert_eq!(incoming["related_table"], "main.order_items");
        assert_eq!(
            incoming["description"],
            "main.orders is referenced by main.order_items through order_id"
        );

        let missing = FindRelatedTables
            .call(&ctx, json!({"table_name": "nope"}))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "not_found");
    }

    #[tokio::test]
    async fn test_query_examples_run() {
        let (_dir, ctx) = test_context().await;
        let result = GetQueryExamples
            .call(&ctx, json!({"table_name": "orders"}))
            .await
            .unwrap();

        let examples = result["examples"].as_object().unwrap();
        assert_eq!(
            examples["select_where"],
            "SELECT * FROM \"main\".\"orders\" WHERE \"customer_id\" = ?"
        );
        assert!(examples["select_columns"]
            .as_str()
            .unwrap()
            .starts_with("SELECT \"id\", \"customer_id\", \"total\" FROM"));
        assert!(examples["select_join"]
            .as_str()
            .unwrap()
            .contains("JOIN \"main\".\"customers\" AS b ON a.\"customer_id\" = b.\"id\""));
        assert!(!examples.contains_key("select_group"));

        for (name, sql) in examples {
            let sql = sql.as_str().unwrap();
            assert!(crate::safety::is_safe(sql), "{name}: {sql}");
            let params = if sql.contains('?') { vec![json!(1)] } else { vec![] };
            ctx.executor
                .query(sql, &params, Some(5))
                .await
                .unwrap_or_else(|e| panic!("{name} failed: {e}"));
        }
    }

    #[tokio::test]
    async fn test_query_examples_without_keys() {
        let (_dir, ctx) = test_context().await;
        let result = GetQueryExamples
            .call(&ctx, json!({"table_name": "customers"}))
            .await
            .unwrap();

        let examples = result["examples"].as_object().unwrap();
        assert!(!examples.contains_key("select_join"));
        assert_eq!(
            examples["count_records"],
            "SELECT COUNT(*) AS total_rows FROM \"main\".\"customers\""
        );
    }
}
