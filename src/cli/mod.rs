//! CLI interface using clap
//!
//! Provides the command-line interface for TableScope

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// TableScope - read-only database tools for agents
#[derive(Parser, Debug)]
#[command(name = "tablescope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (defaults to ./tablescope.toml if present)
    #[arg(short, long, global = true, env = "TABLESCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configured path
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve tools as JSON-RPC over stdin/stdout
    Serve,

    /// List available tools
    Tools,

    /// Invoke a single tool and print its result
    Call(CallArgs),

    /// Show the effective configuration
    Config,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for call command
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Tool name, e.g. list_tables
    pub tool: String,

    /// Tool arguments as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub args: String,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
