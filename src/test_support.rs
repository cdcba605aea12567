//! Test support utilities shared across unit and integration tests.
//!
//! Scripted sessions drive deterministic scheduler outcomes without
//! opening connections or spawning processes: responses are matched by
//! command prefix first (for the repetitive preparation commands) and
//! otherwise consumed in FIFO order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::mirror::{Mirror, MirrorError, MirrorFuture};
use crate::output::Bridge;
use crate::shell::{
    Connector, ExecOutput, LineSink, ProbeFuture, RemoteShell, ShellError, ShellFuture,
};
use crate::task::{Task, TaskId, TaskResult};

/// Scripted response for one executed command.
#[derive(Clone, Debug)]
pub struct ScriptedExec {
    /// Exit code to report.
    pub exit_code: i32,
    /// Lines delivered on stdout.
    pub stdout_lines: Vec<String>,
    /// Lines delivered on stderr.
    pub stderr_lines: Vec<String>,
    /// Simulated execution time for streamed commands.
    pub delay: Option<Duration>,
    /// When set, the command fails with a transport error instead.
    pub transport_error: bool,
}

impl ScriptedExec {
    /// A clean zero exit with no output.
    #[must_use]
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            delay: None,
            transport_error: false,
        }
    }

    /// A clean exit with the given code.
    #[must_use]
    pub fn exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::success()
        }
    }

    /// A zero exit printing the given stdout lines.
    #[must_use]
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout_lines: lines.iter().map(|&line| line.to_owned()).collect(),
            ..Self::success()
        }
    }

    /// A transport failure.
    #[must_use]
    pub fn transport() -> Self {
        Self {
            transport_error: true,
            ..Self::success()
        }
    }

    /// Adds a simulated execution time to a streamed response.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct ScriptedState {
    rules: Vec<(String, ScriptedExec)>,
    queue: VecDeque<ScriptedExec>,
    executed: Vec<String>,
}

/// Scripted [`RemoteShell`] with prefix rules and a FIFO response queue.
///
/// Commands matching no rule and finding the queue empty succeed silently,
/// which keeps simple tests free of boilerplate.
#[derive(Clone, Default)]
pub struct ScriptedShell {
    state: Arc<Mutex<ScriptedState>>,
    alive: Arc<AtomicBool>,
    target: String,
}

impl ScriptedShell {
    /// Creates a shell with no scripted responses.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            state: Arc::default(),
            alive: Arc::new(AtomicBool::new(true)),
            target: target.into(),
        }
    }

    /// Creates a shell whose lock bookkeeping commands all succeed against
    /// an unheld lock.
    #[must_use]
    pub fn with_standard_prep(target: impl Into<String>) -> Self {
        let shell = Self::new(target);
        shell.add_rule("cat ", ScriptedExec::exit(1));
        shell.add_rule("mkdir ", ScriptedExec::success());
        shell.add_rule("printf ", ScriptedExec::success());
        shell.add_rule("rm -rf ", ScriptedExec::success());
        shell.add_rule("test -d ", ScriptedExec::exit(1));
        shell
    }

    /// Registers a repeatable response for commands starting with `prefix`.
    /// Rules are matched in registration order, before the FIFO queue.
    pub fn add_rule(&self, prefix: impl Into<String>, response: ScriptedExec) {
        self.locked().rules.push((prefix.into(), response));
    }

    /// Queues a one-shot response for the next unmatched command.
    pub fn push(&self, response: ScriptedExec) {
        self.locked().queue.push_back(response);
    }

    /// Flips what the liveness probe answers.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Every command executed so far, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.locked().executed.clone()
    }

    /// How many executed commands start with `prefix`.
    #[must_use]
    pub fn executed_count(&self, prefix: &str) -> usize {
        self.locked()
            .executed
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_response(&self, command: &str) -> ScriptedExec {
        let mut state = self.locked();
        state.executed.push(command.to_owned());
        if let Some((_, response)) = state
            .rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return response.clone();
        }
        state
            .queue
            .pop_front()
            .unwrap_or_else(ScriptedExec::success)
    }

    fn transport_failure(&self) -> ShellError {
        ShellError::Transport {
            host: self.target.clone(),
            message: String::from("scripted transport failure"),
        }
    }
}

impl RemoteShell for ScriptedShell {
    fn target(&self) -> &str {
        &self.target
    }

    fn remote_shell_command(&self) -> Option<String> {
        None
    }

    fn exec_capture<'a>(&'a self, command: &'a str) -> ShellFuture<'a, ExecOutput> {
        Box::pin(async move {
            let response = self.next_response(command);
            if response.transport_error {
                return Err(self.transport_failure());
            }
            let mut stdout = response.stdout_lines.join("\n");
            if !stdout.is_empty() {
                stdout.push('\n');
            }
            let mut stderr = response.stderr_lines.join("\n");
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            Ok(ExecOutput {
                exit_code: response.exit_code,
                stdout,
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
            let response = self.next_response(command);
            if let Some(delay) = response.delay {
                tokio::select! {
                    () = cancel.cancelled() => return Err(ShellError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(ShellError::Cancelled);
            }
            if response.transport_error {
                return Err(self.transport_failure());
            }
            for line in &response.stdout_lines {
                sink.line(line, false);
            }
            for line in &response.stderr_lines {
                sink.line(line, true);
            }
            Ok(response.exit_code)
        })
    }

    fn alive(&self) -> ProbeFuture<'_> {
        let alive = self.alive.load(Ordering::SeqCst);
        Box::pin(async move { alive })
    }

    fn close(&self) -> ShellFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Scripted [`Connector`] handing out pre-seeded sessions per host name.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<BTreeMap<String, VecDeque<Result<ScriptedShell, String>>>>,
}

impl ScriptedConnector {
    /// Creates a connector with no seeded sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the next successful session for `host`.
    pub fn add_shell(&self, host: &str, shell: ScriptedShell) {
        self.locked()
            .entry(host.to_owned())
            .or_default()
            .push_back(Ok(shell));
    }

    /// Seeds the next connection attempt for `host` to fail.
    pub fn fail_connect(&self, host: &str, message: &str) {
        self.locked()
            .entry(host.to_owned())
            .or_default()
            .push_back(Err(message.to_owned()));
    }

    fn locked(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, VecDeque<Result<ScriptedShell, String>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for ScriptedConnector {
    type Shell = ScriptedShell;

    fn connect<'a>(&'a self, host: &'a HostConfig) -> ShellFuture<'a, ScriptedShell> {
        let next = self
            .locked()
            .get_mut(&host.name)
            .and_then(VecDeque::pop_front);
        Box::pin(async move {
            match next {
                Some(Ok(shell)) => Ok(shell),
                Some(Err(message)) => Err(ShellError::Connect {
                    host: host.name.clone(),
                    message,
                }),
                None => Err(ShellError::Connect {
                    host: host.name.clone(),
                    message: String::from("no scripted session seeded"),
                }),
            }
        })
    }
}

/// Mirror double that reports success without transferring anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMirror;

impl Mirror for NoopMirror {
    fn sync<'a>(
        &'a self,
        _shell: &'a dyn RemoteShell,
        _host: &'a HostConfig,
        _source: &'a Utf8Path,
        _progress: Option<Arc<dyn LineSink>>,
    ) -> MirrorFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Mirror double that always fails with the given error.
#[derive(Clone, Debug)]
pub struct FailingMirror(pub MirrorError);

impl Mirror for FailingMirror {
    fn sync<'a>(
        &'a self,
        _shell: &'a dyn RemoteShell,
        _host: &'a HostConfig,
        _source: &'a Utf8Path,
        _progress: Option<Arc<dyn LineSink>>,
    ) -> MirrorFuture<'a, ()> {
        let error = self.0.clone();
        Box::pin(async move { Err(error) })
    }
}

/// One observed bridge event, reduced to comparable strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BridgeEvent {
    /// `init_tasks` with the batch's task keys.
    Init(Vec<String>),
    /// `task_syncing(id, host)`.
    Syncing(String, String),
    /// `task_executing(id)`.
    Executing(String),
    /// `task_output(id, line, is_stderr)`.
    Output(String, String, bool),
    /// `task_requeued(id, host)`.
    Requeued(String, String),
    /// `task_completed(id, success)`.
    Completed(String, bool),
}

/// Bridge double recording every event in arrival order.
#[derive(Default)]
pub struct RecordingBridge {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingBridge {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything observed so far.
    #[must_use]
    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events concerning one task, in arrival order.
    #[must_use]
    pub fn events_for(&self, id: &TaskId) -> Vec<BridgeEvent> {
        let key = id.key();
        self.events()
            .into_iter()
            .filter(|event| match event {
                BridgeEvent::Init(_) => false,
                BridgeEvent::Syncing(task, _)
                | BridgeEvent::Executing(task)
                | BridgeEvent::Output(task, _, _)
                | BridgeEvent::Requeued(task, _)
                | BridgeEvent::Completed(task, _) => *task == key,
            })
            .collect()
    }

    fn record(&self, event: BridgeEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl Bridge for RecordingBridge {
    fn init_tasks(&self, tasks: &[Task]) {
        self.record(BridgeEvent::Init(
            tasks.iter().map(|task| task.id.key()).collect(),
        ));
    }

    fn task_syncing(&self, id: &TaskId, host: &str) {
        self.record(BridgeEvent::Syncing(id.key(), host.to_owned()));
    }

    fn task_executing(&self, id: &TaskId) {
        self.record(BridgeEvent::Executing(id.key()));
    }

    fn task_output(&self, id: &TaskId, line: &str, is_stderr: bool) {
        self.record(BridgeEvent::Output(id.key(), line.to_owned(), is_stderr));
    }

    fn task_requeued(&self, id: &TaskId, host: &str) {
        self.record(BridgeEvent::Requeued(id.key(), host.to_owned()));
    }

    fn task_completed(&self, result: &TaskResult) {
        self.record(BridgeEvent::Completed(result.id.key(), result.success()));
    }
}
