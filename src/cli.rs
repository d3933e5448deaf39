use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;

#[derive(ClapParser, Debug)]
#[command(
    author,
    version,
    about = "Keep preloaded application workers warm and run commands through them"
)]
pub struct Args {
    /// Project directory (defaults to the current directory)
    #[arg(short = 'C', long = "project", global = true)]
    pub project: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot the daemon for this project in the foreground
    Server {
        /// Stay in our own process group instead of joining the session leader's
        #[arg(long = "no-session-group")]
        no_session_group: bool,
    },

    /// Run a command through the daemon, booting it if needed
    Run {
        /// Environment to use when the command does not pick one
        #[arg(short, long)]
        env: Option<String>,

        /// Do not boot a daemon when none is running
        #[arg(long = "no-boot")]
        no_boot: bool,

        /// Command and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Show whether a daemon is running for this project
    Status,

    /// Stop the daemon for this project
    Stop {
        /// Seconds to wait after SIGTERM before killing the daemon
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}
