//! SSH sessions over the system OpenSSH client.
//!
//! One backgrounded control master per worker gives session semantics on
//! top of a plain client binary: command execution multiplexes over the
//! control socket, the liveness probe is `-O check`, and teardown is
//! `-O exit`. Authentication, agents, and per-host quirks stay where users
//! already configure them.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;

use super::{
    Connector, ExecOutput, LineSink, ProbeFuture, RemoteShell, ShellError, ShellFuture,
    forward_lines,
};

/// Exit code the OpenSSH client reserves for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Transport tuning shared by every session of a run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Handshake timeout per candidate target, in seconds.
    pub connect_timeout_secs: u64,
    /// Whether to force batch mode to avoid password prompts mid-batch.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known-hosts file override; `None` keeps the client default.
    pub known_hosts_file: Option<String>,
    /// Private key override; `None` falls back to default key locations and
    /// the agent. Supports a leading `~/`.
    pub identity_file: Option<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            connect_timeout_secs: 10,
            batch_mode: true,
            strict_host_key_checking: true,
            known_hosts_file: None,
            identity_file: None,
        }
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// Returns the input unchanged when `HOME` is unset.
#[must_use]
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// One control-mastered SSH session.
#[derive(Debug)]
pub struct SshSession {
    settings: SshSettings,
    host_name: String,
    target: String,
    port: Option<u16>,
    control_path: Utf8PathBuf,
    close_state: Mutex<Option<Result<(), ShellError>>>,
}

impl SshSession {
    /// Tries each candidate target in order and returns a session for the
    /// first whose control master starts within the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Connect`] carrying the last target's
    /// diagnostic when every candidate fails, and [`ShellError::Spawn`]
    /// when the client binary itself cannot be started.
    pub async fn connect(
        settings: &SshSettings,
        host: &HostConfig,
        control_dir: &Utf8Path,
    ) -> Result<Self, ShellError> {
        let control_path = control_dir.join(format!("{}.sock", host.name));
        let mut last_diagnostic = String::from("host has no targets configured");

        for target in &host.targets {
            let session = Self {
                settings: settings.clone(),
                host_name: host.name.clone(),
                target: target.clone(),
                port: host.port,
                control_path: control_path.clone(),
                close_state: Mutex::new(None),
            };
            let output = Command::new(&settings.ssh_bin)
                .args(session.master_args())
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| ShellError::Spawn {
                    program: settings.ssh_bin.clone(),
                    message: err.to_string(),
                })?;
            if output.status.success() {
                return Ok(session);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            last_diagnostic = if stderr.is_empty() {
                format!("{target}: handshake failed")
            } else {
                format!("{target}: {stderr}")
            };
            log::debug!("target {target} of {} rejected: {stderr}", host.name);
        }

        Err(ShellError::Connect {
            host: host.name.clone(),
            message: last_diagnostic,
        })
    }

    /// Options shared by every invocation against this session.
    fn base_options(&self) -> Vec<String> {
        let mut args = vec![
            String::from("-S"),
            self.control_path.to_string(),
            String::from("-o"),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        if self.settings.batch_mode {
            args.push(String::from("-o"));
            args.push(String::from("BatchMode=yes"));
        }
        if !self.settings.strict_host_key_checking {
            args.push(String::from("-o"));
            args.push(String::from("StrictHostKeyChecking=no"));
        }
        if let Some(ref known_hosts) = self.settings.known_hosts_file {
            args.push(String::from("-o"));
            args.push(format!("UserKnownHostsFile={known_hosts}"));
        }
        if let Some(ref identity) = self.settings.identity_file {
            args.push(String::from("-i"));
            args.push(expand_tilde(identity));
        }
        if let Some(port) = self.port {
            args.push(String::from("-p"));
            args.push(port.to_string());
        }
        args
    }

    fn master_args(&self) -> Vec<String> {
        let mut args = vec![
            String::from("-M"),
            String::from("-N"),
            String::from("-f"),
        ];
        args.extend(self.base_options());
        args.push(self.target.clone());
        args
    }

    fn exec_args(&self, command: &str) -> Vec<String> {
        let mut args = self.base_options();
        args.push(self.target.clone());
        args.push(String::from("--"));
        args.push(command.to_owned());
        args
    }

    fn control_args(&self, operation: &str) -> Vec<String> {
        let mut args = vec![
            String::from("-S"),
            self.control_path.to_string(),
            String::from("-O"),
            operation.to_owned(),
        ];
        args.push(self.target.clone());
        args
    }

    fn spawn_error(&self, err: &std::io::Error) -> ShellError {
        ShellError::Spawn {
            program: self.settings.ssh_bin.clone(),
            message: err.to_string(),
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ShellError {
        ShellError::Transport {
            host: self.host_name.clone(),
            message: message.into(),
        }
    }
}

impl RemoteShell for SshSession {
    fn target(&self) -> &str {
        &self.target
    }

    fn remote_shell_command(&self) -> Option<String> {
        let mut parts = vec![self.settings.ssh_bin.clone()];
        parts.extend(self.base_options());
        Some(parts.join(" "))
    }

    fn exec_capture<'a>(&'a self, command: &'a str) -> ShellFuture<'a, ExecOutput> {
        Box::pin(async move {
            let output = Command::new(&self.settings.ssh_bin)
                .args(self.exec_args(command))
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| self.spawn_error(&err))?;
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if exit_code == SSH_TRANSPORT_EXIT {
                return Err(self.transport_error(stderr.trim().to_owned()));
            }
            Ok(ExecOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
            })
        })
    }

    fn exec_stream<'a>(
        &'a self,
        command: &'a str,
        sink: Arc<dyn LineSink>,
        cancel: CancellationToken,
    ) -> ShellFuture<'a, i32> {
        Box::pin(async move {
            let mut child = Command::new(&self.settings.ssh_bin)
                .args(self.exec_args(command))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| self.spawn_error(&err))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| self.transport_error("child stdout was not piped"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| self.transport_error("child stderr was not piped"))?;

            let status = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(ShellError::Cancelled);
                }
                status = async {
                    tokio::join!(
                        forward_lines(stdout, sink.clone(), false),
                        forward_lines(stderr, sink.clone(), true),
                    );
                    child.wait().await
                } => status.map_err(|err| self.spawn_error(&err))?,
            };

            let exit_code = status.code().unwrap_or(-1);
            if exit_code == SSH_TRANSPORT_EXIT {
                return Err(self.transport_error("session dropped while streaming"));
            }
            Ok(exit_code)
        })
    }

    fn alive(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            Command::new(&self.settings.ssh_bin)
                .args(self.control_args("check"))
                .stdin(Stdio::null())
                .output()
                .await
                .map(|output| output.status.success())
                .unwrap_or(false)
        })
    }

    fn close(&self) -> ShellFuture<'_, ()> {
        Box::pin(async move {
            {
                let state = self
                    .close_state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(ref outcome) = *state {
                    return outcome.clone();
                }
            }
            let outcome = Command::new(&self.settings.ssh_bin)
                .args(self.control_args("exit"))
                .stdin(Stdio::null())
                .output()
                .await
                .map(|_| ())
                .map_err(|err| self.spawn_error(&err));
            let mut state = self
                .close_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.get_or_insert_with(|| outcome.clone()).clone()
        })
    }
}

/// Opens [`SshSession`]s, sharing transport settings and the per-run
/// control socket directory.
#[derive(Clone, Debug)]
pub struct SshConnector {
    settings: SshSettings,
    control_dir: Utf8PathBuf,
}

impl SshConnector {
    /// Creates a connector; `control_dir` must exist for the run's lifetime.
    #[must_use]
    pub fn new(settings: SshSettings, control_dir: Utf8PathBuf) -> Self {
        Self {
            settings,
            control_dir,
        }
    }
}

impl Connector for SshConnector {
    type Shell = SshSession;

    fn connect<'a>(&'a self, host: &'a HostConfig) -> ShellFuture<'a, SshSession> {
        Box::pin(SshSession::connect(&self.settings, host, &self.control_dir))
    }
}
