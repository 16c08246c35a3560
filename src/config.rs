//! Configuration for TableScope
//!
//! Settings come from a TOML file (explicit `--config` path or
//! `tablescope.toml` in the working directory), then environment
//! variables prefixed with `TABLESCOPE_` override individual values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "tablescope.toml";

/// Prefix of every environment override
const ENV_PREFIX: &str = "TABLESCOPE_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub digest: DigestSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Open connections read-only and with `query_only` set
    #[serde(default = "default_true")]
    pub read_only: bool,

    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Seconds to wait for a free connection or a locked database
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// Access restrictions applied at the tool boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Schemas tools may touch
    #[serde(default = "default_allowed_schemas")]
    pub allowed_schemas: Vec<String>,

    /// Schema assumed for unqualified table names
    #[serde(default = "default_schema")]
    pub default_schema: String,

    /// Hard cap on rows returned by any query tool
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Seconds a statement may run before it is interrupted
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

/// Usage digest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSettings {
    /// Location of the persisted digest document
    #[serde(default = "default_digest_path")]
    pub path: PathBuf,

    /// Newline-delimited JSON query log used as the history source
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,

    /// Append statements run through `execute_select` to the history log
    #[serde(default = "default_true")]
    pub record_queries: bool,

    /// Hours after which a digest is considered stale
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u64,

    /// Queries shorter than this are ignored as noise
    #[serde(default = "default_min_query_length")]
    pub min_query_length: usize,

    /// How far back the history is read
    #[serde(default = "default_days_history")]
    pub days_history: u32,

    /// Default threshold for `get_usage_digest`
    #[serde(default = "default_min_query_count")]
    pub min_query_count: u64,

    /// Default list size for `get_usage_digest`
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Observations considered per refresh
    #[serde(default = "default_max_history_rows")]
    pub max_history_rows: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("database.sqlite")
}

fn default_pool_size() -> usize {
    5
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_allowed_schemas() -> Vec<String> {
    vec!["main".to_string()]
}

fn default_schema() -> String {
    "main".to_string()
}

fn default_max_rows() -> usize {
    1000
}

fn default_query_timeout() -> u64 {
    30
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tablescope")
}

fn default_digest_path() -> PathBuf {
    data_dir().join("usage_digest.json")
}

fn default_history_path() -> PathBuf {
    data_dir().join("query_history.jsonl")
}

fn default_freshness_hours() -> u64 {
    24
}

fn default_min_query_length() -> usize {
    10
}

fn default_days_history() -> u32 {
    30
}

fn default_min_query_count() -> u64 {
    5
}

fn default_max_results() -> usize {
    50
}

fn default_max_history_rows() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            read_only: true,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_schemas: default_allowed_schemas(),
            default_schema: default_schema(),
            max_rows: default_max_rows(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            path: default_digest_path(),
            history_path: default_history_path(),
            record_queries: true,
            freshness_hours: default_freshness_hours(),
            min_query_length: default_min_query_length(),
            days_history: default_days_history(),
            min_query_count: default_min_query_count(),
            max_results: default_max_results(),
            max_history_rows: default_max_history_rows(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SecuritySettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl DatabaseSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Settings {
    /// Load settings from an explicit file, or `tablescope.toml` in the
    /// working directory if present, then apply environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let local = Path::new(CONFIG_FILE_NAME);
                if local.exists() {
                    Self::from_file(local)?
                } else {
                    Self::default()
                }
            }
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML settings file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(settings)
    }

    /// Serialize the effective settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Apply `TABLESCOPE_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(path) = var("DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(value) = var("READ_ONLY") {
            self.database.read_only = parse_bool(&value)
                .with_context(|| format!("Invalid {ENV_PREFIX}READ_ONLY: {value}"))?;
        }
        if let Some(value) = var("POOL_SIZE") {
            self.database.pool_size = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_PREFIX}POOL_SIZE: {value}"))?;
        }
        if let Some(value) = var("ALLOWED_SCHEMAS") {
            self.security.allowed_schemas = parse_schema_list(&value);
        }
        if let Some(value) = var("DEFAULT_SCHEMA") {
            self.security.default_schema = value.trim().to_string();
        }
        if let Some(value) = var("MAX_ROWS") {
            self.security.max_rows = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_PREFIX}MAX_ROWS: {value}"))?;
        }
        if let Some(value) = var("QUERY_TIMEOUT") {
            self.security.query_timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_PREFIX}QUERY_TIMEOUT: {value}"))?;
        }
        if let Some(path) = var("DIGEST_PATH") {
            self.digest.path = PathBuf::from(path);
        }
        if let Some(path) = var("HISTORY_PATH") {
            self.digest.history_path = PathBuf::from(path);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level.trim().to_lowercase();
        }

        Ok(())
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level '{}', expected one of {:?}",
                self.logging.level,
                VALID_LOG_LEVELS
            );
        }
        if self.database.pool_size == 0 {
            bail!("database.pool_size must be at least 1");
        }
        if self.security.allowed_schemas.is_empty() {
            bail!("security.allowed_schemas must list at least one schema");
        }
        if self.security.max_rows == 0 {
            bail!("security.max_rows must be at least 1");
        }
        if self.security.query_timeout_secs == 0 {
            bail!("security.query_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

/// Accepts a JSON array (`["main","aux"]`) or a comma separated list
fn parse_schema_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
            return list
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    trimmed
        .trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("not a boolean: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.security.allowed_schemas, vec!["main"]);
        assert_eq!(settings.security.max_rows, 1000);
        assert_eq!(settings.database.pool_size, 5);
        assert_eq!(settings.digest.freshness_hours, 24);
        assert!(settings.database.read_only);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [security]
            max_rows = 50

            [digest]
            min_query_count = 2
            "#,
        )
        .unwrap();

        assert_eq!(settings.security.max_rows, 50);
        assert_eq!(settings.security.default_schema, "main");
        assert_eq!(settings.digest.min_query_count, 2);
        assert_eq!(settings.digest.max_results, 50);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TABLESCOPE_DB_PATH", "/tmp/other.db"),
            ("TABLESCOPE_ALLOWED_SCHEMAS", "main, aux"),
            ("TABLESCOPE_MAX_ROWS", "25"),
            ("TABLESCOPE_READ_ONLY", "false"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.database.path, PathBuf::from("/tmp/other.db"));
        assert_eq!(settings.security.allowed_schemas, vec!["main", "aux"]);
        assert_eq!(settings.security.max_rows, 25);
        assert!(!settings.database.read_only);
    }

    #[test]
    fn test_schema_list_formats() {
        assert_eq!(parse_schema_list(r#"["main","temp"]"#), vec!["main", "temp"]);
        assert_eq!(parse_schema_list("main,temp"), vec!["main", "temp"]);
        assert_eq!(parse_schema_list("[main, 'temp']"), vec!["main", "temp"]);
        assert!(parse_schema_list("").is_empty());
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let mut settings = Settings::default();
        let result = settings.apply_env(|key| {
            (key == "TABLESCOPE_POOL_SIZE").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.database.pool_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.security.allowed_schemas.clear();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.security.query_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut settings = Settings::default();
        settings.security.default_schema = "aux".to_string();
        std::fs::write(&path, settings.to_toml().unwrap()).unwrap();

        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded.security.default_schema, "aux");
    }
}
