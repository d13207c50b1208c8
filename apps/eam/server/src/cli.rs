use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eam_client::DEFAULT_URL;

use crate::telemetry::LogLevel;

const DEFAULT_DRY_RUN_DELAY_MS: u64 = 500;

#[derive(Debug, Parser)]
#[command(
    name = "eam",
    author,
    version,
    about = "Remote control server for game automation operators"
)]
pub struct Cli {
    /// Config file; defaults to config/eam.toml beside the executable.
    #[arg(long, global = true, env = "EAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `log.level` from the config file.
    #[arg(long, global = true, value_enum, env = "EAM_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Mirror logs to stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// No subcommand means `serve` with the configured address.
    pub fn resolved_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Serve(ServeArgs::default()))
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the server in the foreground until Ctrl-C.
    Serve(ServeArgs),
    /// Run one tasker locally without the server.
    Run(RunArgs),
    /// Start the server in the background.
    Start(ServeArgs),
    /// Stop the background server.
    Stop,
    /// Print version information.
    Version,
    /// Control a running server over WebSocket.
    #[command(subcommand)]
    Ctl(CtlCommand),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Overrides `server.host`.
    #[arg(long, env = "EAM_HOST")]
    pub host: Option<String>,

    /// Overrides `server.port`.
    #[arg(long, env = "EAM_PORT")]
    pub port: Option<u16>,

    /// Milliseconds each dry-run pipeline takes.
    #[arg(long, default_value_t = DEFAULT_DRY_RUN_DELAY_MS)]
    pub dry_run_delay_ms: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            dry_run_delay_ms: DEFAULT_DRY_RUN_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Tasker id; takes precedence over --name.
    #[arg(long)]
    pub id: Option<String>,

    /// Tasker name.
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long, default_value_t = DEFAULT_DRY_RUN_DELAY_MS)]
    pub dry_run_delay_ms: u64,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CtlCommand {
    /// Start a tasker's run.
    Start {
        #[arg(long)]
        id: String,
        #[arg(long, env = "EAM_URL", default_value = DEFAULT_URL)]
        url: String,
        /// Block until the run's `completed` event arrives.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Stop a tasker's run.
    Stop {
        #[arg(long)]
        id: String,
        #[arg(long, env = "EAM_URL", default_value = DEFAULT_URL)]
        url: String,
    },
}
