use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vetpool_core::orchestration::CleanupPolicy;

/// Run validation tasks in parallel, each in its own session.
#[derive(Parser, Debug)]
#[command(name = "vetpool", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every configured task and report one verdict per task
    Run(RunArgs),
    /// Show previously recorded runs
    History(HistoryArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// JSON configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Comma-separated substrings of task names to skip
    #[arg(long, value_name = "CSV")]
    pub tasks_to_avoid: Option<String>,

    /// Upper bound on tasks running at once
    #[arg(long, value_name = "N")]
    pub maximum_threads: Option<usize>,

    /// Deadline for each task's routine; cleanup still runs after it expires
    #[arg(long, value_name = "SECS")]
    pub task_timeout_secs: Option<u64>,

    /// What a cleanup error does to a passing task: report or fail
    #[arg(long, value_name = "POLICY")]
    pub cleanup_policy: Option<CleanupPolicy>,

    /// Cap on characters per error line in the summary
    #[arg(long, value_name = "N", conflicts_with = "full_errors")]
    pub error_char_limit: Option<usize>,

    /// Keep error lines whole in the summary
    #[arg(long)]
    pub full_errors: bool,

    /// Write the summary JSON to this file
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// POST the summary JSON to this URL
    #[arg(long, value_name = "URL")]
    pub webhook: Option<String>,

    /// Give up on the webhook after this many seconds (default 30)
    #[arg(
        long,
        value_name = "SECS",
        requires = "webhook",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub webhook_timeout_secs: Option<u64>,

    /// Record the run in this SQLite database
    #[arg(long, value_name = "PATH")]
    pub history_db: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `vetpool_core=trace` (overrides RUST_LOG)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Print the summary JSON instead of the coloured table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// SQLite database written by `vetpool run --history-db`
    #[arg(long, value_name = "PATH")]
    pub history_db: PathBuf,

    /// Number of most recent runs to list
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Show the task verdicts of one run
    #[arg(long, value_name = "ID")]
    pub run: Option<u64>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}
