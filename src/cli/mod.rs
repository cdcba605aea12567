//! Command-line interface definitions for the `rr` binary.
//!
//! This module centralises the clap parser structures so both the main
//! binary and the build script can reuse them when generating the manual
//! page.

use clap::Parser;

/// Top-level CLI for the `rr` binary.
#[derive(Debug, Parser)]
#[command(
    name = "rr",
    about = "Mirror your project to remote hosts and fan tasks out over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run tasks across the configured hosts.
    #[command(name = "run", about = "Run tasks across the configured hosts")]
    Run(RunCommand),
    /// Run one ad-hoc command instead of a declared task.
    #[command(
        name = "exec",
        about = "Run one ad-hoc command instead of a declared task"
    )]
    Exec(ExecCommand),
    /// Print the resolved task and host tables.
    #[command(name = "list", about = "Print the resolved task and host tables")]
    List(ListCommand),
    /// Show who holds this project's lock on each host.
    #[command(
        name = "status",
        about = "Show who holds this project's lock on each host"
    )]
    Status(StatusCommand),
    /// Force-release this project's lock on one or all hosts.
    #[command(
        name = "unlock",
        about = "Force-release this project's lock on one or all hosts"
    )]
    Unlock(UnlockCommand),
}

/// Arguments for the `rr run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Tasks to run; with none given, every declared task runs.
    pub(crate) tasks: Vec<String>,
    /// Restrict the run to these hosts, in the given priority order.
    #[arg(long, value_name = "NAME", value_delimiter = ',')]
    pub(crate) hosts: Option<Vec<String>>,
    /// Run everything locally, ignoring configured hosts.
    #[arg(long, conflicts_with = "hosts")]
    pub(crate) local: bool,
    /// Output mode: progress, stream, verbose or quiet.
    #[arg(long, value_name = "MODE")]
    pub(crate) output: Option<String>,
    /// Stop dispatching after the first failure.
    #[arg(long)]
    pub(crate) fail_fast: bool,
    /// Per-task timeout in seconds (0 disables the limit).
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Upper bound on hosts used concurrently.
    #[arg(long, value_name = "N")]
    pub(crate) max_parallel: Option<usize>,
    /// Save per-task logs and a summary under the log directory.
    #[arg(long)]
    pub(crate) save_logs: bool,
    /// Path to the configuration file (defaults to ./rr.yaml).
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Option<String>,
}

/// Arguments for the `rr exec` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExecCommand {
    /// Restrict the run to these hosts, in the given priority order.
    #[arg(long, value_name = "NAME", value_delimiter = ',')]
    pub(crate) hosts: Option<Vec<String>>,
    /// Run the command locally, ignoring configured hosts.
    #[arg(long, conflicts_with = "hosts")]
    pub(crate) local: bool,
    /// Output mode: progress, stream, verbose or quiet.
    #[arg(long, value_name = "MODE")]
    pub(crate) output: Option<String>,
    /// Timeout in seconds (0 disables the limit).
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Path to the configuration file (defaults to ./rr.yaml).
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Option<String>,
    /// Command to execute (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `rr list` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListCommand {
    /// Path to the configuration file (defaults to ./rr.yaml).
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Option<String>,
}

/// Arguments for the `rr status` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct StatusCommand {
    /// Host to query; with none given, every configured host is tried.
    #[arg(long, value_name = "NAME")]
    pub(crate) host: Option<String>,
    /// Path to the configuration file (defaults to ./rr.yaml).
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Option<String>,
}

/// Arguments for the `rr unlock` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct UnlockCommand {
    /// Host to unlock; with none given, every configured host is tried.
    #[arg(long, value_name = "NAME")]
    pub(crate) host: Option<String>,
    /// Path to the configuration file (defaults to ./rr.yaml).
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Option<String>,
}
