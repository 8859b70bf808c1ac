use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::{CLI_SCHEMA_VERSION, DEFAULT_LOG_LEVEL};

#[path = "cli_command_handlers.rs"]
mod cli_command_handlers;
#[path = "cli_config.rs"]
mod cli_config;
#[path = "cli_login.rs"]
mod cli_login;
#[path = "cli_runtime_helpers.rs"]
mod cli_runtime_helpers;
pub(crate) use cli_command_handlers::run_cli;
pub(crate) use cli_config::{WatchConfig, load_watch_config};
pub(crate) use cli_login::run_login_wizard;
pub(crate) use cli_runtime_helpers::{init_tracing, output_error, output_ok};

#[derive(Parser, Debug)]
#[command(name = "mailwatch", version, about = "Multi-account new-mail watcher")]
pub(crate) struct Cli {
    /// Config file to use instead of the default search path.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Run the watcher until interrupted and print notifications.
    Watch(WatchCmd),
    /// Run a single poll cycle and print what it produced.
    Poll,
    /// Sign in interactively, answering every challenge the backend raises.
    Login(LoginCmd),
    /// Show which cadence strategy an interval selects.
    Schedule(ScheduleCmd),
}

#[derive(Args, Debug)]
pub(crate) struct WatchCmd {
    /// Override `[poll] interval_minutes`.
    #[arg(long)]
    pub(crate) interval: Option<u32>,
    /// Queue an immediate poll in addition to the cadence.
    #[arg(long)]
    pub(crate) now: bool,
}

#[derive(Args, Debug)]
pub(crate) struct LoginCmd {
    #[arg(long)]
    pub(crate) email: String,
    /// Keep watching once signed in.
    #[arg(long)]
    pub(crate) watch: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ScheduleCmd {
    #[arg(long)]
    pub(crate) interval: u32,
}
