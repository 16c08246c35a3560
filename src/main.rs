//! TableScope - read-only database tools with a query usage digest
//!
//! Exposes catalog, query and usage-digest tools to agents over stdio.

use anyhow::Result;
use tablescope::cli::{call, list_tools, load_settings, serve, show_config, Cli, Commands};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let cli = Cli::parse_args();
    let settings = load_settings(&cli)?;

    // Setup logging; stdout is reserved for protocol frames
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Execute command
    match &cli.command {
        Commands::Serve => serve(&settings)?,
        Commands::Tools => list_tools(cli.format)?,
        Commands::Call(args) => call(&settings, &args.tool, &args.args)?,
        Commands::Config => show_config(&settings, cli.format)?,
    }

    Ok(())
}
