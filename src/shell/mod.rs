//! Remote shell sessions: one authenticated connection per host.
//!
//! The [`RemoteShell`] trait is the seam between the scheduler and the
//! transport. The production implementation ([`SshSession`]) drives the
//! system OpenSSH client through a control socket; [`LocalShell`] runs the
//! same contract through the platform shell for the local fallback path and
//! for tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;

pub mod command;
mod local;
mod ssh;
#[cfg(test)]
mod tests;

pub use local::LocalShell;
pub use ssh::{SshConnector, SshSession, SshSettings};

/// Future returned by shell operations.
pub type ShellFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ShellError>> + Send + 'a>>;

/// Future returned by the liveness probe; never fails, only answers.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Errors raised by shell transports.
///
/// Non-zero remote exit codes are not errors; they travel through
/// [`ExecOutput`] and the streamed exit code instead.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShellError {
    /// No candidate target of a host completed a handshake.
    #[error("could not connect to {host}: {message}")]
    Connect {
        /// Host whose targets were all unreachable.
        host: String,
        /// Diagnostic from the last attempted target.
        message: String,
    },
    /// The client binary could not be started at all.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// An established session broke mid-operation.
    #[error("connection to {host} broke: {message}")]
    Transport {
        /// Host the session belonged to.
        host: String,
        /// Transport diagnostic.
        message: String,
    },
    /// A streamed command was killed by the shared cancellation signal.
    #[error("remote command cancelled")]
    Cancelled,
}

/// Fully buffered outcome of [`RemoteShell::exec_capture`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecOutput {
    /// Exit code reported by the remote shell.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Receiver for streamed output lines.
pub trait LineSink: Send + Sync {
    /// Called once per complete line, in the order the process produced
    /// them within each stream.
    fn line(&self, line: &str, is_stderr: bool);
}

/// One authenticated session to one host.
pub trait RemoteShell: Send + Sync {
    /// The accepted SSH destination (or a placeholder for local execution).
    fn target(&self) -> &str;

    /// Remote-shell wrapper for transfer tools (`rsync -e …`), reusing this
    /// session's transport options. `None` when execution is local.
    fn remote_shell_command(&self) -> Option<String>;

    /// Runs `command`, buffering both streams fully.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError`] only on transport failure; a non-zero exit is
    /// reported through [`ExecOutput::exit_code`].
    fn exec_capture<'a>(&'a self, command: &'a str) -> ShellFuture<'a, ExecOutput>;

    /// Runs `command`, forwarding each complete output line to `sink` as it
    /// arrives, and returns the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Cancelled`] when `cancel` fires — the process
    /// is killed and no exit code is reported, so callers record no result
    /// for the interrupted command — or another [`ShellError`] on transport
    /// failure.
    fn exec_stream<'a>(
        &'a self,
        command: &'a str,
        sink: Arc<dyn LineSink>,
        cancel: CancellationToken,
    ) -> ShellFuture<'a, i32>;

    /// Lightweight keepalive probe.
    fn alive(&self) -> ProbeFuture<'_>;

    /// Tears the session down. Idempotent; repeated calls return the first
    /// outcome.
    fn close(&self) -> ShellFuture<'_, ()>;
}

/// Forwards complete lines from a child stream to a sink until EOF.
pub(crate) async fn forward_lines<R>(reader: R, sink: Arc<dyn LineSink>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.line(&line, is_stderr);
    }
}

/// Opens sessions on demand, one per host worker.
pub trait Connector: Send + Sync {
    /// Concrete session type produced by this connector.
    type Shell: RemoteShell + Send + Sync + 'static;

    /// Tries the host's candidate targets in order and returns the first
    /// session whose handshake completes.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Connect`] when every target fails.
    fn connect<'a>(&'a self, host: &'a HostConfig) -> ShellFuture<'a, Self::Shell>;
}
