//! Binary entry point for the `rr` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use clap::Parser;
use console::{Term, style};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use rr::config::{Config, ConfigError, DEFAULT_CONFIG_FILE, HostConfig, project_fingerprint};
use rr::lock::Lock;
use rr::mirror::RsyncMirror;
use rr::output::{OutputManager, OutputMode, render_summary};
use rr::report::{ReportError, ReportWriter};
use rr::runner::{BatchOptions, Runner, RunnerError};
use rr::shell::{RemoteShell, SshConnector, SshSession};
use rr::task::{BatchResult, Task, TaskId};

mod cli;

use cli::{Cli, ExecCommand, ListCommand, RunCommand, StatusCommand, UnlockCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    InvalidOutputMode(String),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to read current working directory: {0}")]
    WorkingDir(io::Error),
    #[error("current working directory is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error("could not prepare the control socket directory: {0}")]
    ControlDir(io::Error),
    #[error(transparent)]
    Batch(#[from] RunnerError),
    #[error("failed to save run logs: {0}")]
    SaveLogs(#[from] ReportError),
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RR_LOG", "warn")).init();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            2
        }
    };
    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(args) => run_command(args).await,
        Cli::Exec(args) => exec_command(args).await,
        Cli::List(args) => list_command(&args),
        Cli::Status(args) => status_command(args).await,
        Cli::Unlock(args) => unlock_command(args).await,
    }
}

fn project_root() -> Result<Utf8PathBuf, CliError> {
    let cwd = std::env::current_dir().map_err(CliError::WorkingDir)?;
    Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::NonUtf8Path(path.display().to_string()))
}

fn config_path(root: &Utf8Path, flag: Option<&str>) -> Utf8PathBuf {
    flag.map_or_else(|| root.join(DEFAULT_CONFIG_FILE), Utf8PathBuf::from)
}

/// Creates the per-invocation directory holding SSH control sockets.
fn control_dir() -> Result<Utf8PathBuf, CliError> {
    let dir = std::env::temp_dir().join(format!("rr-{}", process::id()));
    std::fs::create_dir_all(&dir).map_err(CliError::ControlDir)?;
    Utf8PathBuf::from_path_buf(dir)
        .map_err(|path| CliError::NonUtf8Path(path.display().to_string()))
}

/// Flag overrides the batch-running subcommands layer over the settings
/// table.
struct BatchFlags {
    output: Option<String>,
    fail_fast: bool,
    timeout: Option<u64>,
    max_parallel: Option<usize>,
    save_logs: bool,
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let root = project_root()?;
    let config = Config::load(&config_path(&root, args.config.as_deref()))?;
    let tasks = config.resolve_batch(&args.tasks)?;
    let hosts = if args.local {
        Vec::new()
    } else {
        config.select_hosts(args.hosts.as_deref())?
    };
    let flags = BatchFlags {
        output: args.output,
        fail_fast: args.fail_fast,
        timeout: args.timeout,
        max_parallel: args.max_parallel,
        save_logs: args.save_logs,
    };
    execute_batch(&root, &config, hosts, tasks, flags).await
}

async fn exec_command(args: ExecCommand) -> Result<i32, CliError> {
    let root = project_root()?;
    let config = Config::load(&config_path(&root, args.config.as_deref()))?;
    validate_command_args(&args.command)?;
    let task = Task::new(
        TaskId::new("exec", 0),
        render_remote_command(&args.command),
    );
    let hosts = if args.local {
        Vec::new()
    } else {
        config.select_hosts(args.hosts.as_deref())?
    };
    let flags = BatchFlags {
        output: args.output,
        fail_fast: false,
        timeout: args.timeout,
        max_parallel: None,
        save_logs: false,
    };
    execute_batch(&root, &config, hosts, vec![task], flags).await
}

async fn execute_batch(
    root: &Utf8Path,
    config: &Config,
    hosts: Vec<HostConfig>,
    tasks: Vec<Task>,
    flags: BatchFlags,
) -> Result<i32, CliError> {
    let mode = match flags.output.as_deref() {
        Some(raw) => raw
            .parse::<OutputMode>()
            .map_err(CliError::InvalidOutputMode)?,
        None => config.settings.output,
    };
    let fail_fast = flags.fail_fast || config.settings.fail_fast;
    let timeout_secs = flags.timeout.unwrap_or(config.settings.timeout_secs);
    let max_parallel = flags.max_parallel.unwrap_or(config.settings.max_parallel);
    let save_logs = flags.save_logs || config.settings.save_logs;

    let manager = Arc::new(OutputManager::new(mode));
    let sockets = control_dir()?;
    let options = BatchOptions {
        hosts,
        project_root: root.to_path_buf(),
        fingerprint: project_fingerprint(root),
        lock: config.lock.clone(),
        fail_fast,
        max_parallel,
        task_timeout: Duration::from_secs(timeout_secs),
        command_line: Some(std::env::args().collect::<Vec<_>>().join(" ")),
    };
    let runner = Runner::new(
        SshConnector::new(config.ssh.clone(), sockets.clone()),
        Arc::new(RsyncMirror::new(config.mirror.clone())),
        manager.clone(),
        options,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let single_task = tasks.len() == 1;
    let started = Local::now();
    let batch = runner.run(tasks, cancel).await?;
    manager.close();
    render_summary(&Term::stdout(), &batch);

    if save_logs {
        let log_dir = if config.settings.log_dir.is_absolute() {
            config.settings.log_dir.clone()
        } else {
            root.join(&config.settings.log_dir)
        };
        let writer = ReportWriter::new(log_dir, config.settings.keep_runs);
        let run_dir = writer.save("run", &batch, started)?;
        log::info!("saved run logs to {run_dir}");
        if let Err(err) = writer.sweep() {
            log::warn!("log retention sweep failed: {err}");
        }
    }
    let _ = std::fs::remove_dir_all(&sockets);

    Ok(exit_code_for(&batch, single_task))
}

/// Renders an argv into one shell-safe command string, quoting each
/// argument that needs it.
fn render_remote_command(args: &[String]) -> String {
    let mut rendered = String::new();
    for (index, arg) in args.iter().enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.push_str(escape(arg.as_str().into()).as_ref());
    }
    rendered
}

/// Rejects argv entries that could smuggle extra shell statements past the
/// quoting.
fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(
                "command arguments must not contain control characters \
                 (ASCII 0x00-0x1F or 0x7F, e.g. newline, tab, NUL)",
            )));
        }
    }
    Ok(())
}

/// A single task propagates its own exit code; a batch collapses to 0 or 1.
fn exit_code_for(batch: &BatchResult, single_task: bool) -> i32 {
    if single_task {
        batch.results.first().map_or(1, |result| result.exit_code)
    } else if batch.success() {
        0
    } else {
        1
    }
}

fn list_command(args: &ListCommand) -> Result<i32, CliError> {
    let root = project_root()?;
    let config = Config::load(&config_path(&root, args.config.as_deref()))?;
    let term = Term::stdout();

    let _ = term.write_line("tasks:");
    for (name, spec) in &config.tasks {
        let _ = term.write_line(&format!(
            "  {}  {}",
            style(name).bold(),
            style(&spec.cmd).dim()
        ));
    }
    if !config.hosts.is_empty() {
        let _ = term.write_line("hosts:");
        for host in &config.hosts {
            let _ = term.write_line(&format!(
                "  {}  {}",
                style(&host.name).bold(),
                style(host.targets.join(", ")).dim()
            ));
        }
    }
    Ok(0)
}

/// Resolves `--host` against the host table, defaulting to every host.
fn selected_hosts(config: &Config, host: Option<String>) -> Result<Vec<HostConfig>, CliError> {
    match host {
        Some(name) => Ok(vec![config.host(&name).cloned().ok_or_else(|| {
            CliError::Config(ConfigError::UnknownHost { name: name.clone() })
        })?]),
        None => Ok(config.hosts.clone()),
    }
}

async fn status_command(args: StatusCommand) -> Result<i32, CliError> {
    let root = project_root()?;
    let config = Config::load(&config_path(&root, args.config.as_deref()))?;
    let fingerprint = project_fingerprint(&root);
    let hosts = selected_hosts(&config, args.host)?;
    let term = Term::stdout();
    if hosts.is_empty() {
        let _ = term.write_line("no hosts configured");
        return Ok(0);
    }

    let sockets = control_dir()?;
    for host in hosts {
        match SshSession::connect(&config.ssh, &host, &sockets).await {
            Ok(shell) => {
                let dir = config.lock.lock_dir(&fingerprint);
                match Lock::is_locked(&shell, &config.lock, &fingerprint).await {
                    Ok(true) => {
                        let holder = Lock::holder(&shell, &dir).await;
                        let _ = term.write_line(&format!(
                            "{}: {}",
                            style(&host.name).bold(),
                            style(format!("locked by {holder}")).yellow()
                        ));
                    }
                    Ok(false) => {
                        let _ = term.write_line(&format!(
                            "{}: {}",
                            style(&host.name).bold(),
                            style("unlocked").green()
                        ));
                    }
                    Err(err) => {
                        let _ = term.write_line(&format!(
                            "{}: {}",
                            style(&host.name).bold(),
                            style(format!("lock state unknown: {err}")).red()
                        ));
                    }
                }
                let _ = shell.close().await;
            }
            Err(err) => {
                let _ = term.write_line(&format!(
                    "{}: {}",
                    style(&host.name).bold(),
                    style(format!("unreachable: {err}")).red()
                ));
            }
        }
    }
    let _ = std::fs::remove_dir_all(&sockets);
    Ok(0)
}

async fn unlock_command(args: UnlockCommand) -> Result<i32, CliError> {
    let root = project_root()?;
    let config = Config::load(&config_path(&root, args.config.as_deref()))?;
    let fingerprint = project_fingerprint(&root);
    let hosts = selected_hosts(&config, args.host)?;
    let term = Term::stdout();
    if hosts.is_empty() {
        let _ = term.write_line("no hosts configured");
        return Ok(0);
    }

    let sockets = control_dir()?;
    let mut failures = 0;
    for host in hosts {
        match SshSession::connect(&config.ssh, &host, &sockets).await {
            Ok(shell) => {
                let dir = config.lock.lock_dir(&fingerprint);
                let holder = Lock::holder(&shell, &dir).await;
                match Lock::force_release(&shell, &dir).await {
                    Ok(()) => {
                        let _ = term.write_line(&format!(
                            "released lock on {} (was held by {holder})",
                            host.name
                        ));
                    }
                    Err(err) => {
                        failures += 1;
                        let _ = term
                            .write_line(&format!("could not release lock on {}: {err}", host.name));
                    }
                }
                let _ = shell.close().await;
            }
            Err(err) => {
                failures += 1;
                let _ = term.write_line(&format!("could not reach {}: {err}", host.name));
            }
        }
    }
    let _ = std::fs::remove_dir_all(&sockets);
    Ok(i32::from(failures > 0))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    if writeln!(target, "rr: {err}").is_err() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rr::task::{TaskId, TaskResult};

    fn batch_with_exits(exits: &[i32]) -> BatchResult {
        let now = Utc::now();
        let results = exits
            .iter()
            .enumerate()
            .map(|(index, &exit_code)| TaskResult {
                id: TaskId::new("t", index),
                host: String::from("local"),
                exit_code,
                error: None,
                started: now,
                finished: now,
                output: String::new(),
                command: String::from("true"),
            })
            .collect();
        BatchResult::from_results(results, Duration::from_secs(1))
    }

    #[test]
    fn single_task_propagates_its_exit_code() {
        assert_eq!(exit_code_for(&batch_with_exits(&[7]), true), 7);
        assert_eq!(exit_code_for(&batch_with_exits(&[0]), true), 0);
    }

    #[test]
    fn batch_collapses_to_zero_or_one() {
        assert_eq!(exit_code_for(&batch_with_exits(&[0, 0]), false), 0);
        assert_eq!(exit_code_for(&batch_with_exits(&[0, 3]), false), 1);
    }

    #[test]
    fn config_path_prefers_explicit_flag() {
        let root = Utf8Path::new("/work/project");
        assert_eq!(
            config_path(root, None),
            Utf8PathBuf::from("/work/project/rr.yaml")
        );
        assert_eq!(
            config_path(root, Some("/etc/rr.yaml")),
            Utf8PathBuf::from("/etc/rr.yaml")
        );
    }

    #[test]
    fn render_remote_command_escapes_arguments() {
        let args = vec![
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ];
        assert_eq!(render_remote_command(&args), "echo 'a b' 'c'\\''d'");
    }

    #[test]
    fn validate_command_args_rejects_control_characters() {
        let err = validate_command_args(&[String::from("echo\tbad")])
            .expect_err("tab should be rejected");
        assert!(
            matches!(err, CliError::InvalidCommand(ref message) if message.contains("control characters")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_command_args_accepts_safe_arguments() {
        assert!(validate_command_args(&[String::from("echo"), String::from("ok")]).is_ok());
    }

    #[test]
    fn write_error_prefixes_the_binary_name() {
        let mut buf = Vec::new();
        write_error(
            &mut buf,
            &CliError::InvalidOutputMode(String::from("unknown output mode \"x\"")),
        );
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.starts_with("rr: "), "rendered: {rendered}");
    }
}
