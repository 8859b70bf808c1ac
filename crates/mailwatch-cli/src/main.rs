use anyhow::Result;
use clap::Parser;

mod cli;
mod render_mod;

use crate::cli::{Cli, init_tracing, load_watch_config, output_error, run_cli};

const CLI_SCHEMA_VERSION: &str = "mailwatch.cli.v1";
const DEFAULT_LOG_LEVEL: &str = "info";

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_watch_config(cli.config.as_deref());
    init_tracing(config.log_level.as_deref());
    if let Some(err) = config.load_error.as_deref() {
        tracing::warn!(%err, "config not loaded, using defaults");
    }

    let rt = tokio::runtime::Runtime::new()?;
    if let Err(err) = run_cli(&rt, cli.command, &config) {
        return output_error(&format!("{:#}", err));
    }
    Ok(())
}
