//! Loopback execution through the platform shell.
//!
//! Implements the session contract with `sh -c` so the local fallback path
//! and the remote path share one worker implementation.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::task::LOCAL_HOST;

use super::{
    ExecOutput, LineSink, ProbeFuture, RemoteShell, ShellError, ShellFuture, forward_lines,
};

/// Pseudo-session that runs commands on the invoking machine.
#[derive(Clone, Debug)]
pub struct LocalShell {
    shell_bin: String,
}

impl LocalShell {
    /// Creates a loopback shell using `sh`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell_bin: String::from("sh"),
        }
    }

    fn spawn_error(&self, err: &std::io::Error) -> ShellError {
        ShellError::Spawn {
            program: self.shell_bin.clone(),
            message: err.to_string(),
        }
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteShell for LocalShell {
    fn target(&self) -> &str {
        LOCAL_HOST
    }

    fn remote_shell_command(&self) -> Option<String> {
        None
    }

    fn exec_capture<'a>(&'a self, command: &'a str) -> ShellFuture<'a, ExecOutput> {
        Box::pin(async move {
            let output = Command::new(&self.shell_bin)
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| self.spawn_error(&err))?;
            Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
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
            let mut child = Command::new(&self.shell_bin)
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| self.spawn_error(&err))?;
            let stdout = child.stdout.take().ok_or_else(|| ShellError::Transport {
                host: String::from(LOCAL_HOST),
                message: String::from("child stdout was not piped"),
            })?;
            let stderr = child.stderr.take().ok_or_else(|| ShellError::Transport {
                host: String::from(LOCAL_HOST),
                message: String::from("child stderr was not piped"),
            })?;

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

            Ok(status.code().unwrap_or(-1))
        })
    }

    fn alive(&self) -> ProbeFuture<'_> {
        Box::pin(async { true })
    }

    fn close(&self) -> ShellFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
