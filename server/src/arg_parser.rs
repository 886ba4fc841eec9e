use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run commands as isolated, resource-limited jobs
#[derive(Debug, Parser)]
#[clap(name = "jobworker")]
pub struct ArgParser {
    /// Path to a TOML config file with `[jobs]` and `[policy]` tables
    #[clap(short = 'c', long = "config", env = "JOBWORKER_CONFIG")]
    pub config: Option<PathBuf>,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum SubCommand {
    /// run one job in the foreground and stream its output
    Run {
        #[clap(short = 'u', long = "user", env = "USER")]
        /// principal the job is started on behalf of
        user: String,

        #[clap(long)]
        /// send SIGKILL instead of SIGTERM on Ctrl-C
        force: bool,

        /// name or path of the command to run
        command: String,

        #[clap(last = true)]
        /// a list of args to the command
        args: Vec<String>,
    },
}
