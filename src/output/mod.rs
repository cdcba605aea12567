//! Event fan-in from workers and terminal rendering.
//!
//! Workers report every task lifecycle transition to a [`Bridge`]; the
//! [`OutputManager`] is the terminal-facing implementation, rendering those
//! events in one of four modes without ever interleaving partial lines.
//! External dashboards can observe the same stream by wrapping a manager.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Deserialize;

use crate::task::{BatchResult, Task, TaskId, TaskResult, TaskStatus};

mod buffer;
#[cfg(test)]
mod tests;

pub use buffer::{MAX_TASK_OUTPUT, TRUNCATION_NOTICE, TaskBuffer};

/// How task lifecycles are rendered.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Live per-task view; downgrades to `quiet` off a terminal.
    #[default]
    Progress,
    /// Real-time interleaved lines prefixed with `[host:task]`.
    Stream,
    /// Buffered per task, printed in full on completion.
    Verbose,
    /// Only user-important warnings during the run.
    Quiet,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "progress" => Ok(Self::Progress),
            "stream" => Ok(Self::Stream),
            "verbose" => Ok(Self::Verbose),
            "quiet" => Ok(Self::Quiet),
            other => Err(format!(
                "unknown output mode {other:?}; expected progress, stream, verbose or quiet"
            )),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Progress => "progress",
            Self::Stream => "stream",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
        };
        f.write_str(label)
    }
}

/// Observer of task lifecycle events. All methods are concurrency-safe and
/// must preserve each worker's emission order.
pub trait Bridge: Send + Sync {
    /// Registers the whole batch as pending before any worker starts.
    fn init_tasks(&self, tasks: &[Task]);
    /// A worker claimed the task and is preparing `host`.
    fn task_syncing(&self, id: &TaskId, host: &str);
    /// The task's command started executing.
    fn task_executing(&self, id: &TaskId);
    /// One complete output line arrived.
    fn task_output(&self, id: &TaskId, line: &str, is_stderr: bool);
    /// The task went back to the queue because `host` became unusable.
    fn task_requeued(&self, id: &TaskId, host: &str);
    /// The task reached a terminal state.
    fn task_completed(&self, result: &TaskResult);
}

struct ProgressView {
    multi: MultiProgress,
    bars: BTreeMap<String, ProgressBar>,
}

struct ManagerState {
    statuses: BTreeMap<String, TaskStatus>,
    hosts: BTreeMap<String, String>,
    progress: Option<ProgressView>,
}

/// Terminal-facing [`Bridge`] implementation.
pub struct OutputManager {
    mode: OutputMode,
    term: Term,
    state: Mutex<ManagerState>,
}

impl OutputManager {
    /// Creates a manager for `mode`, silently downgrading `progress` to
    /// `quiet` when stdout is not a terminal.
    #[must_use]
    pub fn new(mode: OutputMode) -> Self {
        let term = Term::stdout();
        let mode = if mode == OutputMode::Progress && !term.is_term() {
            OutputMode::Quiet
        } else {
            mode
        };
        Self {
            mode,
            term,
            state: Mutex::new(ManagerState {
                statuses: BTreeMap::new(),
                hosts: BTreeMap::new(),
                progress: None,
            }),
        }
    }

    /// The effective mode after any downgrade.
    #[must_use]
    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Current status of one task.
    #[must_use]
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.locked().statuses.get(&id.key()).copied()
    }

    /// Snapshot of every task's status, keyed by `name#index`.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, TaskStatus> {
        self.locked().statuses.clone()
    }

    /// Finishes rendering; leftover progress bars are cleared.
    pub fn close(&self) {
        let mut state = self.locked();
        if let Some(view) = state.progress.take() {
            for bar in view.bars.values() {
                if !bar.is_finished() {
                    bar.finish_and_clear();
                }
            }
            let _ = view.multi.clear();
        }
        let _ = self.term.flush();
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(&self, line: &str) {
        let _ = self.term.write_line(line);
    }

    /// Emits a warning that must reach the user in every mode.
    fn warn(&self, state: &ManagerState, message: &str) {
        let rendered = format!("{} {message}", style("!").yellow().bold());
        if let Some(ref view) = state.progress {
            let _ = view.multi.println(rendered);
        } else {
            let _ = self.term.write_line(&rendered);
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} {spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Renders a duration the way the summary does: tenths of a second under a
/// minute, minutes and seconds above.
#[must_use]
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        let minutes = (secs / 60.0).floor() as u64;
        let rest = secs - (minutes as f64) * 60.0;
        format!("{minutes}m{rest:04.1}s")
    }
}

fn completion_note(result: &TaskResult) -> String {
    if result.success() {
        format!("passed in {}", human_duration(result.duration()))
    } else if let Some(ref error) = result.error {
        format!("failed: {error}")
    } else {
        format!(
            "failed (exit {}) in {}",
            result.exit_code,
            human_duration(result.duration())
        )
    }
}

impl Bridge for OutputManager {
    fn init_tasks(&self, tasks: &[Task]) {
        let mut state = self.locked();
        for task in tasks {
            state.statuses.insert(task.id.key(), TaskStatus::Pending);
        }
        if self.mode == OutputMode::Progress {
            let multi = MultiProgress::new();
            let mut bars = BTreeMap::new();
            for task in tasks {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(spinner_style());
                bar.set_prefix(task.id.to_string());
                bar.set_message("pending");
                bar.enable_steady_tick(Duration::from_millis(100));
                bars.insert(task.id.key(), bar);
            }
            state.progress = Some(ProgressView { multi, bars });
        }
    }

    fn task_syncing(&self, id: &TaskId, host: &str) {
        let mut state = self.locked();
        state.statuses.insert(id.key(), TaskStatus::Syncing);
        state.hosts.insert(id.key(), host.to_owned());
        match self.mode {
            OutputMode::Progress => {
                if let Some(bar) = state.progress.as_ref().and_then(|v| v.bars.get(&id.key())) {
                    bar.set_message(format!("syncing on {host}"));
                }
            }
            OutputMode::Stream => {
                self.write_line(&format!(
                    "{} syncing",
                    style(format!("[{host}:{id}]")).dim()
                ));
            }
            OutputMode::Verbose | OutputMode::Quiet => {}
        }
    }

    fn task_executing(&self, id: &TaskId) {
        let mut state = self.locked();
        state.statuses.insert(id.key(), TaskStatus::Running);
        let host = state.hosts.get(&id.key()).cloned().unwrap_or_default();
        match self.mode {
            OutputMode::Progress => {
                if let Some(bar) = state.progress.as_ref().and_then(|v| v.bars.get(&id.key())) {
                    bar.set_message(format!("running on {host}"));
                }
            }
            OutputMode::Stream => {
                self.write_line(&format!(
                    "{} running",
                    style(format!("[{host}:{id}]")).dim()
                ));
            }
            OutputMode::Verbose | OutputMode::Quiet => {}
        }
    }

    fn task_output(&self, id: &TaskId, line: &str, is_stderr: bool) {
        if self.mode != OutputMode::Stream {
            return;
        }
        let state = self.locked();
        let host = state.hosts.get(&id.key()).cloned().unwrap_or_default();
        let prefix = style(format!("[{host}:{id}]")).dim();
        if is_stderr {
            self.write_line(&format!("{prefix} {}", style(line).yellow()));
        } else {
            self.write_line(&format!("{prefix} {line}"));
        }
    }

    fn task_requeued(&self, id: &TaskId, host: &str) {
        let mut state = self.locked();
        state.statuses.insert(id.key(), TaskStatus::Pending);
        state.hosts.remove(&id.key());
        if let Some(bar) = state.progress.as_ref().and_then(|v| v.bars.get(&id.key())) {
            bar.set_message("pending");
        }
        self.warn(
            &state,
            &format!("task {id} requeued: host {host} became unreachable"),
        );
    }

    fn task_completed(&self, result: &TaskResult) {
        let mut state = self.locked();
        let status = if result.success() {
            TaskStatus::Passed
        } else {
            TaskStatus::Failed
        };
        state.statuses.insert(result.id.key(), status);
        let note = completion_note(result);
        let styled_note = if result.success() {
            style(note).green().to_string()
        } else {
            style(note).red().to_string()
        };

        match self.mode {
            OutputMode::Progress => {
                if let Some(bar) = state
                    .progress
                    .as_ref()
                    .and_then(|v| v.bars.get(&result.id.key()))
                {
                    bar.finish_with_message(styled_note);
                }
            }
            OutputMode::Stream => {
                let prefix = style(format!("[{}:{}]", result.host, result.id)).dim();
                self.write_line(&format!("{prefix} {styled_note}"));
            }
            OutputMode::Verbose => {
                let symbol = if result.success() {
                    style("✓").green().bold()
                } else {
                    style("✗").red().bold()
                };
                self.write_line(&format!(
                    "{symbol} {} ({}, {})",
                    style(result.id.to_string()).bold(),
                    result.host,
                    human_duration(result.duration())
                ));
                for line in result.output.lines() {
                    self.write_line(line);
                }
            }
            OutputMode::Quiet => {}
        }
    }
}

/// Number of trailing output lines quoted for each failure in the summary.
const FAILURE_SNIPPET_LINES: usize = 10;

/// Prints the post-run summary, sorted by task name.
pub fn render_summary(term: &Term, batch: &BatchResult) {
    let mut results: Vec<&TaskResult> = batch.results.iter().collect();
    results.sort_by(|a, b| a.id.cmp(&b.id));

    let _ = term.write_line("");
    for result in &results {
        let symbol = if result.success() {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        };
        let _ = term.write_line(&format!(
            "{symbol} {} {}",
            style(result.id.to_string()).bold(),
            style(format!(
                "({}, {})",
                result.host,
                human_duration(result.duration())
            ))
            .dim()
        ));
        if result.success() {
            continue;
        }
        if let Some(ref error) = result.error {
            let _ = term.write_line(&format!("  {}", style(error.to_string()).red()));
        }
        let lines: Vec<&str> = result.output.lines().collect();
        let start = lines.len().saturating_sub(FAILURE_SNIPPET_LINES);
        for line in lines.iter().skip(start) {
            let _ = term.write_line(&format!("  {}", style(*line).dim()));
        }
    }

    let verdict = format!(
        "{} passed, {} failed in {}",
        batch.passed,
        batch.failed,
        human_duration(batch.duration)
    );
    let verdict = if batch.success() {
        style(verdict).green().to_string()
    } else {
        style(verdict).red().to_string()
    };
    let hosts = batch
        .hosts_used
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let _ = term.write_line("");
    if hosts.is_empty() {
        let _ = term.write_line(&verdict);
    } else {
        let _ = term.write_line(&format!("{verdict} {}", style(format!("on {hosts}")).dim()));
    }
}
