//! One-way project mirroring onto a host.
//!
//! The mirror makes the host's base directory a faithful copy of the local
//! project by driving `rsync` over the worker's established session.
//! Deletions propagate, except for paths matching the `preserve` rules;
//! `exclude` rules are never copied at all.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::HostConfig;
use crate::shell::command::{quote, remote_dir};
use crate::shell::{LineSink, RemoteShell, forward_lines};

#[cfg(test)]
mod tests;

/// Mirror tuning from the project configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorSettings {
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Path patterns never copied to the host.
    pub exclude: Vec<String>,
    /// Path patterns never deleted on the host, even when absent locally.
    pub preserve: Vec<String>,
    /// Pass-through tuning flags for the transfer tool.
    pub extra_flags: Vec<String>,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            rsync_bin: String::from("rsync"),
            exclude: Vec::new(),
            preserve: Vec::new(),
            extra_flags: Vec::new(),
        }
    }
}

/// Errors raised while mirroring.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MirrorError {
    /// The transfer tool is not installed on the invoking machine.
    #[error("{program} is not installed or not on PATH; install it to sync remote hosts")]
    Unavailable {
        /// Binary that could not be found.
        program: String,
    },
    /// The transfer tool was found but could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Binary that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The transfer ran and failed.
    #[error("sync to {host} failed: {message}")]
    Failed {
        /// Host the mirror targeted.
        host: String,
        /// Captured tool diagnostic.
        message: String,
    },
}

/// Future returned by mirror operations.
pub type MirrorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MirrorError>> + Send + 'a>>;

/// Seam between the worker and the transfer machinery, so scheduler tests
/// need no transfer tool.
pub trait Mirror: Send + Sync {
    /// Brings `host`'s base directory up to date with `source`.
    ///
    /// Progress bytes go to `progress` when given; they are informational
    /// and never parsed. Loopback hosts are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Unavailable`] when the tool is missing
    /// locally, [`MirrorError::Failed`] otherwise.
    fn sync<'a>(
        &'a self,
        shell: &'a dyn RemoteShell,
        host: &'a HostConfig,
        source: &'a Utf8Path,
        progress: Option<Arc<dyn LineSink>>,
    ) -> MirrorFuture<'a, ()>;
}

/// Production mirror shelling out to `rsync`.
#[derive(Clone, Debug)]
pub struct RsyncMirror {
    settings: MirrorSettings,
}

impl RsyncMirror {
    /// Creates a mirror with the given tuning.
    #[must_use]
    pub fn new(settings: MirrorSettings) -> Self {
        Self { settings }
    }

    /// Builds the full argument vector for one transfer.
    fn build_args(&self, rsh: Option<&str>, source: &Utf8Path, destination: &str) -> Vec<String> {
        let mut args = vec![String::from("-az"), String::from("--delete")];
        for pattern in &self.settings.exclude {
            args.push(String::from("--exclude"));
            args.push(pattern.clone());
        }
        for pattern in &self.settings.preserve {
            args.push(String::from("--filter"));
            args.push(format!("P {pattern}"));
        }
        args.extend(self.settings.extra_flags.iter().cloned());
        if let Some(rsh) = rsh {
            args.push(String::from("-e"));
            args.push(rsh.to_owned());
        }
        args.push(format!("{source}/"));
        args.push(destination.to_owned());
        args
    }
}

impl Mirror for RsyncMirror {
    fn sync<'a>(
        &'a self,
        shell: &'a dyn RemoteShell,
        host: &'a HostConfig,
        source: &'a Utf8Path,
        progress: Option<Arc<dyn LineSink>>,
    ) -> MirrorFuture<'a, ()> {
        Box::pin(async move {
            if host.is_loopback() {
                return Ok(());
            }
            if which::which(&self.settings.rsync_bin).is_err() {
                return Err(MirrorError::Unavailable {
                    program: self.settings.rsync_bin.clone(),
                });
            }

            let dir = remote_dir(&host.dir);
            let mkdir = format!("mkdir -p {}", quote(&dir));
            let created = shell
                .exec_capture(&mkdir)
                .await
                .map_err(|err| MirrorError::Failed {
                    host: host.name.clone(),
                    message: err.to_string(),
                })?;
            if !created.is_success() {
                return Err(MirrorError::Failed {
                    host: host.name.clone(),
                    message: format!("could not create {}: {}", host.dir, created.stderr.trim()),
                });
            }

            let destination = format!("{}:{dir}", shell.target());
            let args = self.build_args(shell.remote_shell_command().as_deref(), source, &destination);
            log::debug!("mirroring {source} to {destination}");

            let mut child = Command::new(&self.settings.rsync_bin)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| MirrorError::Spawn {
                    program: self.settings.rsync_bin.clone(),
                    message: err.to_string(),
                })?;

            let mut diagnostic = String::new();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let forward = async {
                if let (Some(stdout), Some(sink)) = (stdout, progress.clone()) {
                    forward_lines(stdout, sink, false).await;
                }
            };
            let collect = async {
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if !diagnostic.is_empty() {
                            diagnostic.push('\n');
                        }
                        diagnostic.push_str(&line);
                    }
                }
            };
            tokio::join!(forward, collect);

            let status = child.wait().await.map_err(|err| MirrorError::Spawn {
                program: self.settings.rsync_bin.clone(),
                message: err.to_string(),
            })?;
            if status.success() {
                Ok(())
            } else {
                let code = status.code().unwrap_or(-1);
                let message = if diagnostic.is_empty() {
                    format!("rsync exited with status {code}")
                } else {
                    format!("rsync exited with status {code}: {diagnostic}")
                };
                Err(MirrorError::Failed {
                    host: host.name.clone(),
                    message,
                })
            }
        })
    }
}
