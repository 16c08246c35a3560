//! TableScope - read-only database introspection for agents
//!
//! This library provides schema discovery and validated SELECT execution
//! against SQLite, plus a persisted digest of which tables, fields and joins
//! historical queries actually use.

pub mod cli;
pub mod config;
pub mod db;
pub mod digest;
pub mod safety;
pub mod server;
pub mod tools;

/// Re-export commonly used types
pub use config::Settings;
pub use db::{Catalog, SqlExecutor, SqliteDatabase};
pub use digest::{DigestService, UsageDigest};
pub use safety::{is_safe, with_row_limit};
pub use tools::{ToolContext, ToolError, ToolRegistry};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "tablescope";
