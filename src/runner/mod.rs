//! Batch orchestration: the shared queue, the fleet, and result collection.
//!
//! The runner owns the task queue, spawns one worker per selected host in
//! priority order, and collects results until every queued task has a
//! terminal outcome. The queue stays open to admit requeued tasks; it is
//! closed by the collector the moment the result count matches the batch,
//! so workers blocked on an empty queue wake up instead of deadlocking
//! against a dispatcher that is itself waiting for a requeue.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::lock::LockSettings;
use crate::mirror::Mirror;
use crate::output::Bridge;
use crate::shell::command::compose;
use crate::shell::{Connector, LocalShell, RemoteShell, ShellError};
use crate::task::{BatchResult, LOCAL_HOST, Task, TaskError, TaskResult};
use crate::worker::{FAILURE_EXIT_CODE, HostWorker, TIMEOUT_EXIT_CODE, TaskSink};

mod throttle;

use throttle::FleetTimings;

/// Errors for inputs no run can be built from. Everything that goes wrong
/// *during* a run is recorded on individual task results instead.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Two tasks in one batch share the same `(name, index)` identity.
    #[error("duplicate task id in batch: {id}")]
    DuplicateTaskId {
        /// The colliding identity.
        id: String,
    },
}

/// Scheduling knobs for one run, resolved from configuration and CLI.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Hosts in priority order; empty selects the local fallback.
    pub hosts: Vec<HostConfig>,
    /// Local project root to mirror and to run local tasks in.
    pub project_root: Utf8PathBuf,
    /// Opaque identifier scoping the per-host lock.
    pub fingerprint: String,
    /// Lock tuning.
    pub lock: LockSettings,
    /// Stop dispatching after the first failure.
    pub fail_fast: bool,
    /// Upper bound on concurrent workers; `0` means one per host.
    pub max_parallel: usize,
    /// Per-task timeout; zero disables the limit.
    pub task_timeout: Duration,
    /// Invoking command line, recorded in the lock info file.
    pub command_line: Option<String>,
}

/// State shared by every worker of one run.
pub(crate) struct RunContext {
    pub(crate) queue_rx: async_channel::Receiver<Task>,
    pub(crate) queue_tx: async_channel::Sender<Task>,
    pub(crate) bridge: Arc<dyn Bridge>,
    pub(crate) mirror: Arc<dyn Mirror>,
    pub(crate) cancel: CancellationToken,
    pub(crate) fail_fast: bool,
    pub(crate) task_timeout: Duration,
    pub(crate) lock_settings: LockSettings,
    pub(crate) fingerprint: String,
    pub(crate) project_root: Utf8PathBuf,
    pub(crate) command_line: Option<String>,
    results: mpsc::UnboundedSender<TaskResult>,
    failed: AtomicBool,
    timings: Mutex<FleetTimings>,
    unavailable: Mutex<BTreeSet<String>>,
    active: AtomicUsize,
    worker_count: usize,
}

impl RunContext {
    /// Marks a host unusable; `true` means every worker's host now is.
    pub(crate) fn mark_unavailable(&self, host: &str) -> bool {
        let mut down = self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        down.insert(host.to_owned());
        down.len() >= self.worker_count
    }

    /// Number of workers that have not shut down yet.
    pub(crate) fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn worker_done(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Latches the shared failed flag and cancels the run exactly once.
    pub(crate) fn trip_fail_fast(&self) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    /// Pushes a result to the collector, then notifies the bridge.
    pub(crate) fn emit(&self, result: TaskResult) {
        let _ = self.results.send(result.clone());
        self.bridge.task_completed(&result);
    }

    pub(crate) fn record_first_task(&self, host: &str, duration: Duration) {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_first(host, duration);
    }

    pub(crate) fn throttle_delay(&self, host: &str) -> Option<Duration> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delay_for(host)
    }
}

/// Owns one batch execution across a fleet of hosts.
pub struct Runner<C: Connector> {
    connector: Arc<C>,
    mirror: Arc<dyn Mirror>,
    bridge: Arc<dyn Bridge>,
    options: BatchOptions,
}

impl<C: Connector + 'static> Runner<C> {
    /// Creates a runner; `options.hosts` decides between the remote fleet
    /// and the local fallback.
    pub fn new(
        connector: C,
        mirror: Arc<dyn Mirror>,
        bridge: Arc<dyn Bridge>,
        options: BatchOptions,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            mirror,
            bridge,
            options,
        }
    }

    /// Runs the batch to completion, cancellation, or fleet exhaustion.
    ///
    /// Cancellation is not an error: the batch result then holds whatever
    /// completed. An empty batch returns an empty result immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] only for inputs no run can be built from.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<BatchResult, RunnerError> {
        let started = Instant::now();
        if tasks.is_empty() {
            return Ok(BatchResult::default());
        }
        let mut seen = BTreeSet::new();
        for task in &tasks {
            if !seen.insert(task.id.key()) {
                return Err(RunnerError::DuplicateTaskId { id: task.id.key() });
            }
        }

        self.bridge.init_tasks(&tasks);
        if self.options.hosts.is_empty() {
            return Ok(self.run_local(tasks, cancel, started).await);
        }
        Ok(self.run_fleet(tasks, cancel, started).await)
    }

    async fn run_fleet(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
        started: Instant,
    ) -> BatchResult {
        let total = tasks.len();
        let (queue_tx, queue_rx) = async_channel::bounded(total);
        for task in tasks {
            // Capacity equals the batch size and every requeue follows a
            // pop, so feeding the queue never blocks.
            let _ = queue_tx.try_send(task);
        }

        let worker_count = {
            let cap = if self.options.max_parallel > 0 {
                self.options.max_parallel
            } else {
                usize::MAX
            };
            self.options.hosts.len().min(total).min(cap)
        };

        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(RunContext {
            queue_rx: queue_rx.clone(),
            queue_tx: queue_tx.clone(),
            bridge: self.bridge.clone(),
            mirror: self.mirror.clone(),
            cancel: cancel.clone(),
            fail_fast: self.options.fail_fast,
            task_timeout: self.options.task_timeout,
            lock_settings: self.options.lock.clone(),
            fingerprint: self.options.fingerprint.clone(),
            project_root: self.options.project_root.clone(),
            command_line: self.options.command_line.clone(),
            results: results_tx,
            failed: AtomicBool::new(false),
            timings: Mutex::new(FleetTimings::default()),
            unavailable: Mutex::new(BTreeSet::new()),
            active: AtomicUsize::new(worker_count),
            worker_count,
        });

        let mut workers = JoinSet::new();
        for host in self.options.hosts.iter().take(worker_count) {
            let worker = HostWorker::new(host.clone(), self.connector.clone(), ctx.clone());
            workers.spawn(worker.run());
        }

        // The allDone signal: close the queue once every task has a
        // terminal result, so idle workers stop waiting for requeues that
        // can no longer come.
        let all_done_queue = queue_rx.clone();
        let collector = tokio::spawn(async move {
            let mut collected: Vec<TaskResult> = Vec::new();
            while let Some(result) = results_rx.recv().await {
                collected.push(result);
                if collected.len() >= total {
                    all_done_queue.close();
                }
            }
            collected
        });

        while workers.join_next().await.is_some() {}

        // Backstop for the race where the fleet died right as a task was
        // being requeued: nobody is left to run what is still queued.
        if !cancel.is_cancelled() {
            while let Ok(task) = queue_rx.try_recv() {
                let now = Utc::now();
                ctx.emit(TaskResult {
                    id: task.id.clone(),
                    host: String::new(),
                    exit_code: FAILURE_EXIT_CODE,
                    error: Some(TaskError::AllHostsDown),
                    started: now,
                    finished: now,
                    output: String::new(),
                    command: task.command,
                });
            }
        }
        queue_rx.close();
        drop(ctx);

        let results = collector.await.unwrap_or_default();
        BatchResult::from_results(results, started.elapsed())
    }

    /// Sequential fallback used when no hosts are configured: every task
    /// runs through the platform shell under the same lifecycle events,
    /// attributed to [`LOCAL_HOST`].
    async fn run_local(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
        started: Instant,
    ) -> BatchResult {
        let shell = LocalShell::new();
        let mut results = Vec::new();

        for task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            self.bridge.task_syncing(&task.id, LOCAL_HOST);
            self.bridge.task_executing(&task.id);

            let workdir = match task.workdir {
                Some(ref sub) => format!("{}/{sub}", self.options.project_root),
                None => self.options.project_root.to_string(),
            };
            let command = compose(&[], Some(&workdir), &task.env, &task.command);
            let sink = Arc::new(TaskSink::new(task.id.clone(), self.bridge.clone()));
            let task_started = Utc::now();
            let task_cancel = cancel.child_token();

            let exec = shell.exec_stream(&command, sink.clone(), task_cancel.clone());
            let outcome = if self.options.task_timeout.is_zero() {
                exec.await.map(Some)
            } else {
                match tokio::time::timeout(self.options.task_timeout, exec).await {
                    Ok(outcome) => outcome.map(Some),
                    Err(_elapsed) => {
                        task_cancel.cancel();
                        Ok(None)
                    }
                }
            };

            let result = match outcome {
                Ok(Some(exit_code)) => TaskResult {
                    id: task.id.clone(),
                    host: String::from(LOCAL_HOST),
                    exit_code,
                    error: None,
                    started: task_started,
                    finished: Utc::now(),
                    output: sink.output(),
                    command: task.command.clone(),
                },
                Ok(None) => TaskResult {
                    id: task.id.clone(),
                    host: String::from(LOCAL_HOST),
                    exit_code: TIMEOUT_EXIT_CODE,
                    error: Some(TaskError::Timeout {
                        seconds: self.options.task_timeout.as_secs(),
                    }),
                    started: task_started,
                    finished: Utc::now(),
                    output: sink.output(),
                    command: task.command.clone(),
                },
                Err(ShellError::Cancelled) => break,
                Err(err) => TaskResult {
                    id: task.id.clone(),
                    host: String::from(LOCAL_HOST),
                    exit_code: FAILURE_EXIT_CODE,
                    error: Some(TaskError::Connect {
                        host: String::from(LOCAL_HOST),
                        message: err.to_string(),
                    }),
                    started: task_started,
                    finished: Utc::now(),
                    output: String::new(),
                    command: task.command.clone(),
                },
            };

            let failed = !result.success();
            self.bridge.task_completed(&result);
            results.push(result);
            if failed && self.options.fail_fast {
                break;
            }
        }

        BatchResult::from_results(results, started.elapsed())
    }
}
