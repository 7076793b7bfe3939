// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! The CLI is a thin wrapper: everything here is folded into a
//! [`RunConfig`](crate::config::RunConfig) before the engine sees it.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `rundag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rundag",
    version,
    about = "Run a dependency-driven task graph, skipping work that is up to date.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Rundag.toml")]
    pub config: String,

    /// Input directory made available to tasks as `{input}`.
    #[arg(long, value_name = "DIR")]
    pub input: Option<String>,

    /// Output directory; also holds the history store and run log.
    #[arg(long, value_name = "DIR")]
    pub output: Option<String>,

    /// Number of tasks to execute locally in parallel.
    #[arg(long, value_name = "N")]
    pub local_jobs: Option<usize>,

    /// Number of grid submissions allowed to be in flight at once.
    #[arg(long, value_name = "N")]
    pub grid_jobs: Option<usize>,

    /// Grid backend to submit gridable tasks to (slurm, sge).
    #[arg(long, value_name = "NAME")]
    pub grid: Option<String>,

    /// Grid partition / queue name.
    #[arg(long, value_name = "NAME")]
    pub grid_partition: Option<String>,

    /// Only run tasks needed to produce these targets. Patterns containing
    /// `*`, `?` or `[` use glob semantics.
    #[arg(long, value_name = "NAME")]
    pub target: Vec<String>,

    /// Don't run tasks producing these targets, nor their dependents.
    #[arg(long, value_name = "NAME")]
    pub exclude_target: Vec<String>,

    /// Don't run these tasks (by name or id), nor their dependents.
    #[arg(long, value_name = "NAME")]
    pub exclude_task: Vec<String>,

    /// Stop dispatching new tasks once this task (by name or id) finishes.
    #[arg(long, value_name = "NAME")]
    pub until_task: Option<String>,

    /// Plan only: report which tasks would run, execute nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Stop dispatching new tasks as soon as any task fails.
    #[arg(long)]
    pub quit_early: bool,

    /// Skip no tasks, even if their fingerprints are unchanged.
    #[arg(long)]
    pub skip_nothing: bool,

    /// Strict mode: pre-existing dependencies must be declared explicitly.
    #[arg(long)]
    pub strict: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUNDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
