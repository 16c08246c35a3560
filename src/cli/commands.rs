//! Command implementations

use super::{Cli, OutputFormat};
use crate::config::Settings;
use crate::server::McpServer;
use crate::tools::{ToolContext, ToolRegistry};
use anyhow::{Context, Result};
use serde_json::Value;

/// Load settings and apply command-line overrides
pub fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(path) = &cli.database {
        settings.database.path = path.clone();
    }
    if cli.verbose {
        settings.logging.level = "debug".to_string();
    }
    Ok(settings)
}

async fn open_context(settings: &Settings) -> Result<ToolContext> {
    ToolContext::open(settings)
        .await
        .with_context(|| format!("Failed to open database {:?}", settings.database.path))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Serve the tool registry over stdio until the client disconnects
pub fn serve(settings: &Settings) -> Result<()> {
    runtime()?.block_on(async {
        let server = McpServer::new(open_context(settings).await?);
        server.run_stdio().await.context("stdio transport failed")
    })
}

/// Print the registered tools
pub fn list_tools(format: OutputFormat) -> Result<()> {
    let descriptors = ToolRegistry::new().descriptors();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }
        OutputFormat::Text => {
            println!("Available tools ({})", descriptors.len());
            println!("===================\n");
            for tool in &descriptors {
                println!("  {:<26} {}", tool.name, tool.description);
            }
        }
    }

    Ok(())
}

/// Invoke one tool and print its JSON result.
///
/// A tool failure is printed as its structured error and reported as an
/// error so the process exits non-zero.
pub fn call(settings: &Settings, tool: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be a JSON object")?;

    let result = runtime()?.block_on(async {
        let ctx = open_context(settings).await?;
        Ok::<_, anyhow::Error>(ToolRegistry::new().call(&ctx, tool, args).await)
    })?;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_json())?);
            anyhow::bail!("{} failed: {}", tool, e.code())
        }
    }
}

/// Print the effective configuration
pub fn show_config(settings: &Settings, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(settings)?),
        OutputFormat::Text => print!("{}", settings.to_toml()?),
    }
    Ok(())
}
