//! Tool registry
//!
//! Each tool is a unit struct implementing [`Tool`]. Tools receive every
//! dependency through a [`ToolContext`] built once at startup; nothing is
//! registered through globals.

mod analyze;
mod builder;
mod digest;
mod error;
mod query;
mod schema;

pub use builder::{FilterOp, SelectBuilder};
pub use error::ToolError;

use crate::config::{DigestSettings, Settings};
use crate::db::{Catalog, DbError, SqlExecutor, SqliteDatabase};
use crate::digest::{DigestOptions, DigestService, DigestStore, JsonLinesHistory};
use crate::safety::AccessPolicy;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A named operation callable by an agent
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the argument object
    fn input_schema(&self) -> Value;

    /// Run the tool. Statements are bounded by the pool's query timeout.
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError>;
}

/// Dependencies shared by every tool
pub struct ToolContext {
    pub executor: Arc<dyn SqlExecutor>,
    pub catalog: Arc<dyn Catalog>,
    pub policy: AccessPolicy,
    pub max_rows: usize,
    pub digest: DigestService,
    pub digest_settings: DigestSettings,
    /// Where `execute_select` records statements, if enabled
    pub history_log: Option<Arc<JsonLinesHistory>>,
}

impl ToolContext {
    /// Open the configured database and wire up the digest service
    pub async fn open(settings: &Settings) -> Result<Self, DbError> {
        let db = Arc::new(SqliteDatabase::from_settings(settings).await?);
        let history = Arc::new(JsonLinesHistory::new(&settings.digest.history_path));

        let digest = DigestService::new(
            DigestStore::new(&settings.digest.path),
            history.clone(),
            db.clone(),
            DigestOptions::from_settings(&settings.digest, &settings.security.default_schema),
        );

        Ok(Self {
            executor: db.clone(),
            catalog: db,
            policy: AccessPolicy::new(
                settings.security.allowed_schemas.clone(),
                settings.security.default_schema.clone(),
            ),
            max_rows: settings.security.max_rows,
            digest,
            digest_settings: settings.digest.clone(),
            history_log: settings.digest.record_queries.then_some(history),
        })
    }

    /// Effective row cap for a requested limit
    pub fn row_cap(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_rows)
            .clamp(1, self.max_rows.max(1))
    }
}

/// Name, description and schema of a registered tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Every tool, looked up by name
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: vec![
                Box::new(schema::ListSchemas),
                Box::new(schema::ListTables),
                Box::new(schema::GetTableSchema),
                Box::new(schema::FindForeignKeys),
                Box::new(schema::GetDatabaseInfo),
                Box::new(schema::SearchSchemaObjects),
                Box::new(schema::FindRelatedTables),
                Box::new(schema::GetQueryExamples),
                Box::new(query::ExecuteSelect),
                Box::new(query::GetSampleData),
                Box::new(query::ExplainQuery),
                Box::new(query::QueryTable),
                Box::new(analyze::AnalyzeTableData),
                Box::new(analyze::FindDuplicateRecords),
                Box::new(digest::GetUsageDigest),
                Box::new(digest::UpdateUsageDigest),
                Box::new(digest::GetTableImportance),
                Box::new(digest::SuggestImportantJoins),
                Box::new(digest::ExportUsageReport),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|tool| tool.name() == name)
            .map(|tool| tool.as_ref())
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name(),
                description: tool.description(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// Invoke a tool by name
    pub async fn call(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(format!("unknown tool: {name}")))?;

        tracing::debug!("Calling tool {}", name);
        let result = tool.call(ctx, args).await;
        if let Err(e) = &result {
            tracing::warn!("Tool {} failed ({}): {}", name, e.code(), e);
        }
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize a tool's argument object; `null` counts as `{}`
pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    Ok(serde_json::from_value(args)?)
}

pub(crate) fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Internal(e.to_string()))
}
