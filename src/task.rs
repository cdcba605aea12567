//! Task and batch data model shared across the scheduler.
//!
//! A [`Task`] is one unit of work pulled from the shared queue; a
//! [`TaskResult`] is its terminal outcome; a [`BatchResult`] aggregates one
//! `run` invocation. Identity is `(name, index)` where the index
//! disambiguates duplicate names within a single batch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Host name recorded for tasks executed through the local fallback path.
pub const LOCAL_HOST: &str = "local";

/// Identity of a task within one batch.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId {
    /// Task name as configured.
    pub name: String,
    /// Occurrence index, disambiguating duplicate names in one batch.
    pub index: usize,
}

impl TaskId {
    /// Creates an identity from a name and its occurrence index.
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Renders the `name#index` key used wherever tasks are stored by id.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}#{}", self.name, self.index)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.index)
    }
}

/// One unit of work: a command plus its execution context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Task {
    /// Batch-unique identity.
    pub id: TaskId,
    /// User command, passed to the remote shell verbatim after composition.
    pub command: String,
    /// Environment exported before the command runs. Sorted by name so the
    /// composed command line is deterministic.
    pub env: BTreeMap<String, String>,
    /// Optional working subdirectory below the host's base directory.
    pub workdir: Option<String>,
}

impl Task {
    /// Creates a task with no environment and no working subdirectory.
    pub fn new(id: TaskId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }
}

/// Finite lifecycle states of a task.
///
/// `Pending → Syncing → Running → {Passed | Failed}`, with `Syncing →
/// Pending` when a task is requeued off a dead host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    /// Queued, not yet claimed by a worker.
    Pending,
    /// Claimed; the worker is preparing its host.
    Syncing,
    /// The command is executing.
    Running,
    /// Terminal: exit code 0 and no error.
    Passed,
    /// Terminal: non-zero exit or an error.
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Errors attached to individual task results.
///
/// These are recorded, not propagated: a batch keeps running (or stops under
/// fail-fast) and the summary decides presentation. Cloneable because a
/// poisoned worker replays its cached setup error onto every later task.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TaskError {
    /// No SSH target of the host completed a handshake.
    #[error("could not connect to {host}: {message}")]
    Connect {
        /// Host that was unreachable.
        host: String,
        /// Last transport diagnostic.
        message: String,
    },
    /// The local transfer tool is missing.
    #[error("{message}")]
    SyncUnavailable {
        /// Diagnostic naming the missing tool.
        message: String,
    },
    /// The transfer tool exited non-zero.
    #[error("sync to {host} failed: {message}")]
    SyncFailed {
        /// Host the mirror targeted.
        host: String,
        /// Captured tool diagnostic.
        message: String,
    },
    /// Lock acquisition exceeded the configured timeout.
    #[error("lock on {host} timed out: held by {holder}")]
    LockTimeout {
        /// Host whose lock was contended.
        host: String,
        /// Best-effort description of the current holder.
        holder: String,
    },
    /// Transport or filesystem failure during lock operations.
    #[error("lock operation on {host} failed: {message}")]
    Lock {
        /// Host the lock lives on.
        host: String,
        /// Diagnostic with hint text.
        message: String,
    },
    /// A host setup command exited non-zero or the connection died.
    #[error("setup on {host} failed: {message}")]
    Setup {
        /// Host whose setup failed.
        host: String,
        /// Setup diagnostic; replayed onto every later task of the worker.
        message: String,
    },
    /// The per-task timeout elapsed and the remote process was killed.
    #[error("task exceeded timeout of {seconds}s")]
    Timeout {
        /// Configured limit in seconds.
        seconds: u64,
    },
    /// The host stopped answering mid-run.
    #[error("host {host} became unreachable")]
    Unreachable {
        /// Host that went away.
        host: String,
    },
    /// Every selected host is unavailable while tasks remain queued.
    #[error("all hosts are unreachable")]
    AllHostsDown,
    /// The invocation was cancelled by the user.
    #[error("cancelled")]
    Cancelled,
}

/// Terminal outcome of one task.
#[derive(Clone, Debug)]
pub struct TaskResult {
    /// Identity of the task this result belongs to.
    pub id: TaskId,
    /// Host that handled the task, or [`LOCAL_HOST`].
    pub host: String,
    /// Exit code observed, or the conventional substitute for failures that
    /// never produced one.
    pub exit_code: i32,
    /// Failure detail; `None` on a clean (even non-zero) exit.
    pub error: Option<TaskError>,
    /// Wall-clock start.
    pub started: DateTime<Utc>,
    /// Wall-clock end.
    pub finished: DateTime<Utc>,
    /// Combined stdout and stderr, bounded to the per-task cap.
    pub output: String,
    /// Original user command string.
    pub command: String,
}

impl TaskResult {
    /// True when the task exited zero without any recorded error.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// True when the command actually started executing on its host, as
    /// opposed to failing during preparation.
    #[must_use]
    pub fn executed(&self) -> bool {
        matches!(self.error, None | Some(TaskError::Timeout { .. }))
    }

    /// Wall-clock duration between start and end.
    #[must_use]
    pub fn duration(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }
}

/// Aggregate outcome of one `run` invocation.
#[derive(Clone, Debug, Default)]
pub struct BatchResult {
    /// Results in completion order.
    pub results: Vec<TaskResult>,
    /// Total wall-clock duration of the batch.
    pub duration: Duration,
    /// Hosts that executed at least one task.
    pub hosts_used: BTreeSet<String>,
    /// Count of successful tasks.
    pub passed: usize,
    /// Count of failed tasks.
    pub failed: usize,
}

impl BatchResult {
    /// Builds the aggregate from collected results.
    #[must_use]
    pub fn from_results(results: Vec<TaskResult>, duration: Duration) -> Self {
        let passed = results.iter().filter(|r| r.success()).count();
        let failed = results.len() - passed;
        let hosts_used = results
            .iter()
            .filter(|r| r.executed())
            .map(|r| r.host.clone())
            .collect();
        Self {
            results,
            duration,
            hosts_used,
            passed,
            failed,
        }
    }

    /// True when no task failed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, exit_code: i32, error: Option<TaskError>) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            id: TaskId::new(name, 0),
            host: String::from("alpha"),
            exit_code,
            error,
            started: now,
            finished: now,
            output: String::new(),
            command: String::from("true"),
        }
    }

    #[test]
    fn task_id_renders_name_and_index() {
        assert_eq!(TaskId::new("build", 2).to_string(), "build#2");
        assert_eq!(TaskId::new("build", 0).key(), "build#0");
    }

    #[test]
    fn success_requires_zero_exit_and_no_error() {
        assert!(result("a", 0, None).success());
        assert!(!result("a", 1, None).success());
        assert!(!result("a", 0, Some(TaskError::AllHostsDown)).success());
    }

    #[test]
    fn batch_counts_and_hosts() {
        let results = vec![
            result("a", 0, None),
            result("b", 1, None),
            result(
                "c",
                1,
                Some(TaskError::Connect {
                    host: String::from("alpha"),
                    message: String::from("refused"),
                }),
            ),
        ];
        let batch = BatchResult::from_results(results, Duration::from_secs(1));
        assert_eq!(batch.passed, 1);
        assert_eq!(batch.failed, 2);
        assert!(!batch.success());
        // The connect failure never executed, but the other two results did.
        assert_eq!(batch.hosts_used.len(), 1);
        assert!(batch.hosts_used.contains("alpha"));
    }
}
