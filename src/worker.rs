//! Per-host worker: serialise host preparation, then execute queued tasks.
//!
//! Each worker owns one lazily opened session, at most one held lock, and
//! the memory of whether its host has been prepared. Preparation happens
//! once per worker lifetime, under the lock: mirror the project, then run
//! the host's setup fragments. A failed preparation poisons the worker and
//! its cached error is replayed onto every further task it touches.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::HostConfig;
use crate::lock::{Lock, LockError, LockRecord};
use crate::mirror::MirrorError;
use crate::output::{Bridge, TaskBuffer};
use crate::runner::RunContext;
use crate::shell::command::{compose, remote_dir};
use crate::shell::{Connector, LineSink, RemoteShell, ShellError};
use crate::task::{Task, TaskError, TaskId, TaskResult};

/// Exit code recorded for failures that never produced one.
pub(crate) const FAILURE_EXIT_CODE: i32 = 1;

/// Exit code recorded when the per-task timeout kills the command.
pub(crate) const TIMEOUT_EXIT_CODE: i32 = 124;

/// Forwards streamed lines to the bridge while accumulating the bounded
/// combined buffer that becomes the result's captured output.
pub(crate) struct TaskSink {
    id: TaskId,
    bridge: Arc<dyn Bridge>,
    buffer: Mutex<TaskBuffer>,
}

impl TaskSink {
    pub(crate) fn new(id: TaskId, bridge: Arc<dyn Bridge>) -> Self {
        Self {
            id,
            bridge,
            buffer: Mutex::new(TaskBuffer::new()),
        }
    }

    pub(crate) fn output(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contents()
            .to_owned()
    }
}

impl LineSink for TaskSink {
    fn line(&self, line: &str, is_stderr: bool) {
        self.bridge.task_output(&self.id, line, is_stderr);
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_line(line);
    }
}

/// One host's worker.
pub(crate) struct HostWorker<C: Connector> {
    host: HostConfig,
    connector: Arc<C>,
    ctx: Arc<RunContext>,
    shell: Option<C::Shell>,
    lock: Option<Lock>,
    prepared: Option<Result<(), TaskError>>,
    has_completed_task: bool,
}

impl<C: Connector> HostWorker<C> {
    pub(crate) fn new(host: HostConfig, connector: Arc<C>, ctx: Arc<RunContext>) -> Self {
        Self {
            host,
            connector,
            ctx,
            shell: None,
            lock: None,
            prepared: None,
            has_completed_task: false,
        }
    }

    /// Pulls tasks until the queue drains, the run is cancelled, or the
    /// host becomes unusable, then releases every held resource.
    pub(crate) async fn run(mut self) {
        while let Some(task) = self.next_task().await {
            if !self.handle(task).await {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Claims the next task, observing cancellation and the slow-host
    /// throttle. The throttle never delays a task that is already
    /// available without contention.
    async fn next_task(&mut self) -> Option<Task> {
        if self.ctx.cancel.is_cancelled() {
            return None;
        }
        match self.ctx.queue_rx.try_recv() {
            Ok(task) => return Some(task),
            Err(async_channel::TryRecvError::Closed) => return None,
            Err(async_channel::TryRecvError::Empty) => {}
        }
        if self.has_completed_task
            && let Some(delay) = self.ctx.throttle_delay(&self.host.name)
        {
            log::debug!(
                "host {} holding back {}ms for faster hosts",
                self.host.name,
                delay.as_millis()
            );
            tokio::select! {
                () = self.ctx.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
        }
        tokio::select! {
            () = self.ctx.cancel.cancelled() => None,
            task = self.ctx.queue_rx.recv() => task.ok(),
        }
    }

    /// Runs one task through the per-task state machine. Returns `false`
    /// when the worker must stop pulling work.
    async fn handle(&mut self, task: Task) -> bool {
        let started = Utc::now();
        self.ctx.bridge.task_syncing(&task.id, &self.host.name);

        // Ensure the connection, probing an existing one first.
        if self.shell.is_none() {
            match self.connector.connect(&self.host).await {
                Ok(shell) => self.shell = Some(shell),
                Err(err) => {
                    let error = TaskError::Connect {
                        host: self.host.name.clone(),
                        message: err.to_string(),
                    };
                    return self.host_gone(task, error, started).await;
                }
            }
        } else {
            let alive = match self.shell.as_ref() {
                Some(shell) => shell.alive().await,
                None => false,
            };
            if !alive {
                let error = TaskError::Unreachable {
                    host: self.host.name.clone(),
                };
                return self.host_gone(task, error, started).await;
            }
        }

        // Sync, lock and setup exactly once per worker lifetime.
        if self.prepared.is_none() {
            let Some(shell) = self.shell.as_ref() else {
                return false;
            };
            let outcome = prepare(shell, &self.host, &self.ctx, &mut self.lock).await;
            self.prepared = Some(outcome);
        }
        if let Some(Err(error)) = self.prepared.clone() {
            if error == TaskError::Cancelled {
                return false;
            }
            let result = self.failure_result(&task, error, started);
            let keep_going = self.finish(result);
            // A poisoned worker keeps draining only when nobody else could
            // pick the remaining tasks up.
            return keep_going && self.ctx.active_workers() == 1;
        }

        self.ctx.bridge.task_executing(&task.id);

        let Some(shell) = self.shell.as_ref() else {
            return false;
        };
        let command = compose_task_command(&self.host, &task);
        let sink = Arc::new(TaskSink::new(task.id.clone(), self.ctx.bridge.clone()));
        let task_cancel = self.ctx.cancel.child_token();

        // `None` marks a timeout; the scripted and real transports both get
        // their process killed by dropping the streaming future.
        let exec = shell.exec_stream(&command, sink.clone(), task_cancel.clone());
        let outcome = if self.ctx.task_timeout.is_zero() {
            exec.await.map(Some)
        } else {
            match tokio::time::timeout(self.ctx.task_timeout, exec).await {
                Ok(done) => done.map(Some),
                Err(_elapsed) => {
                    task_cancel.cancel();
                    Ok(None)
                }
            }
        };

        match outcome {
            Ok(Some(exit_code)) => {
                let result = TaskResult {
                    id: task.id.clone(),
                    host: self.host.name.clone(),
                    exit_code,
                    error: None,
                    started,
                    finished: Utc::now(),
                    output: sink.output(),
                    command: task.command.clone(),
                };
                self.finish(result)
            }
            Ok(None) => {
                let result = TaskResult {
                    id: task.id.clone(),
                    host: self.host.name.clone(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    error: Some(TaskError::Timeout {
                        seconds: self.ctx.task_timeout.as_secs(),
                    }),
                    started,
                    finished: Utc::now(),
                    output: sink.output(),
                    command: task.command.clone(),
                };
                self.finish(result)
            }
            // User cancellation: the process was killed and the batch
            // reports whatever completed before it.
            Err(ShellError::Cancelled) => false,
            Err(ShellError::Transport { .. }) => {
                let error = TaskError::Unreachable {
                    host: self.host.name.clone(),
                };
                self.host_gone(task, error, started).await
            }
            Err(err) => {
                let error = TaskError::Connect {
                    host: self.host.name.clone(),
                    message: err.to_string(),
                };
                let result = self.failure_result(&task, error, started);
                self.finish(result)
            }
        }
    }

    /// The host is unusable: requeue the unfinished task for another
    /// worker, or fail it (and everything still queued) when no worker is
    /// left. Always stops this worker.
    async fn host_gone(&mut self, task: Task, error: TaskError, started: DateTime<Utc>) -> bool {
        log::warn!("marking host {} unavailable: {error}", self.host.name);
        let all_down = self.ctx.mark_unavailable(&self.host.name);
        if all_down {
            let result = self.failure_result(&task, error, started);
            let _ = self.finish(result);
            while let Ok(pending) = self.ctx.queue_rx.try_recv() {
                let result = self.failure_result(&pending, TaskError::AllHostsDown, Utc::now());
                let _ = self.finish(result);
            }
        } else if self.ctx.queue_tx.send(task.clone()).await.is_ok() {
            self.ctx.bridge.task_requeued(&task.id, &self.host.name);
        }
        false
    }

    fn failure_result(&self, task: &Task, error: TaskError, started: DateTime<Utc>) -> TaskResult {
        TaskResult {
            id: task.id.clone(),
            host: self.host.name.clone(),
            exit_code: FAILURE_EXIT_CODE,
            error: Some(error),
            started,
            finished: Utc::now(),
            output: String::new(),
            command: task.command.clone(),
        }
    }

    /// Records the result and reports it. Returns `false` when the worker
    /// must stop because fail-fast tripped on this failure.
    fn finish(&mut self, result: TaskResult) -> bool {
        if !self.has_completed_task {
            self.has_completed_task = true;
            self.ctx.record_first_task(&self.host.name, result.duration());
        }
        let failed = !result.success();
        self.ctx.emit(result);
        if failed && self.ctx.fail_fast {
            self.ctx.trip_fail_fast();
            return false;
        }
        true
    }

    async fn shutdown(&mut self) {
        if let Some(shell) = self.shell.as_ref() {
            if let Some(lock) = self.lock.as_mut() {
                if let Err(err) = lock.release(shell).await {
                    log::warn!("could not release lock on {}: {err}", self.host.name);
                }
            }
            if let Err(err) = shell.close().await {
                log::debug!("closing session to {} failed: {err}", self.host.name);
            }
        }
        self.ctx.worker_done();
    }
}

/// One-time host preparation: lock, mirror, then setup fragments.
async fn prepare(
    shell: &dyn RemoteShell,
    host: &HostConfig,
    ctx: &RunContext,
    lock_slot: &mut Option<Lock>,
) -> Result<(), TaskError> {
    let record = LockRecord::for_current_process(ctx.command_line.clone());
    let lock = Lock::acquire(
        shell,
        &ctx.lock_settings,
        &ctx.fingerprint,
        &record,
        &ctx.cancel,
    )
    .await
    .map_err(|err| lock_error(&host.name, err))?;
    *lock_slot = Some(lock);

    ctx.mirror
        .sync(shell, host, &ctx.project_root, None)
        .await
        .map_err(|err| match err {
            MirrorError::Unavailable { .. } => TaskError::SyncUnavailable {
                message: err.to_string(),
            },
            other => TaskError::SyncFailed {
                host: host.name.clone(),
                message: other.to_string(),
            },
        })?;

    for fragment in &host.setup {
        let output =
            shell
                .exec_capture(fragment)
                .await
                .map_err(|err| TaskError::Setup {
                    host: host.name.clone(),
                    message: err.to_string(),
                })?;
        if !output.is_success() {
            return Err(TaskError::Setup {
                host: host.name.clone(),
                message: format!(
                    "`{fragment}` exited with status {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
    }
    Ok(())
}

fn lock_error(host: &str, err: LockError) -> TaskError {
    match err {
        LockError::Timeout { holder, .. } => TaskError::LockTimeout {
            host: host.to_owned(),
            holder,
        },
        LockError::Cancelled => TaskError::Cancelled,
        other => TaskError::Lock {
            host: host.to_owned(),
            message: other.to_string(),
        },
    }
}

/// Composes the command for one task on one host: setup fragments, the
/// working directory change, environment exports, then the user command.
pub(crate) fn compose_task_command(host: &HostConfig, task: &Task) -> String {
    let base = remote_dir(&host.dir);
    let workdir = match task.workdir {
        Some(ref sub) => format!("{base}/{sub}"),
        None => base,
    };
    compose(&host.setup, Some(&workdir), &task.env, &task.command)
}
