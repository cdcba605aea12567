//! Cooperative per-host mutual exclusion.
//!
//! Competing invocations that target the same `(host, fingerprint)` pair
//! serialise on a directory created atomically on the host: `mkdir` without
//! `-p` succeeds iff the directory did not exist, which is the one
//! filesystem primitive every sshd-reachable system agrees on. The
//! directory carries an `info.json` identifying the holder so a blocked
//! invocation can say who it is waiting for.
//!
//! Absence is explicit throughout: callers hold an `Option<Lock>`, and
//! releasing twice (or never acquiring at all) is not an error.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::shell::RemoteShell;
use crate::shell::command::quote;

mod record;

pub use record::LockRecord;

/// Fixed back-off between acquisition attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Placeholder when the holder cannot be identified.
pub const UNKNOWN_HOLDER: &str = "unknown holder";

/// Lock tuning from the project configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    /// Directory on the host holding lock directories; empty means `/tmp`.
    pub dir: String,
    /// How long a blocking acquisition waits before giving up, in seconds.
    pub timeout_secs: u64,
    /// Age beyond which an existing lock may be purged, in seconds;
    /// `0` disables staleness detection.
    pub stale_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            dir: String::new(),
            timeout_secs: 300,
            stale_secs: 3600,
        }
    }
}

impl LockSettings {
    /// Acquisition timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Staleness threshold as a duration.
    #[must_use]
    pub fn stale(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    /// Base directory, with the `/tmp` default applied.
    #[must_use]
    pub fn base_dir(&self) -> &str {
        if self.dir.trim().is_empty() {
            "/tmp"
        } else {
            &self.dir
        }
    }

    /// Full lock directory path for a fingerprint.
    #[must_use]
    pub fn lock_dir(&self, fingerprint: &str) -> String {
        format!("{}/rr-{fingerprint}.lock", self.base_dir())
    }
}

/// Errors raised by lock operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LockError {
    /// One-shot acquisition found the lock held.
    #[error("lock is held by {holder}")]
    Locked {
        /// Best-effort holder description.
        holder: String,
    },
    /// Blocking acquisition exhausted its timeout.
    #[error("timed out after {seconds}s waiting for the lock; held by {holder}")]
    Timeout {
        /// Configured timeout in seconds.
        seconds: u64,
        /// Best-effort holder description.
        holder: String,
    },
    /// Transport or filesystem failure during a lock operation.
    #[error(
        "lock operation failed: {message}; check connectivity and write access to the lock directory"
    )]
    Transport {
        /// Underlying diagnostic.
        message: String,
    },
    /// Acquisition was cancelled by the shared signal.
    #[error("lock acquisition cancelled")]
    Cancelled,
}

fn transport(err: impl std::fmt::Display) -> LockError {
    LockError::Transport {
        message: err.to_string(),
    }
}

/// A held lock: the directory exists on the host and names us in its info
/// file until [`Lock::release`] removes it.
#[derive(Debug)]
pub struct Lock {
    dir: String,
    released: bool,
}

impl Lock {
    /// Path of the lock directory on the host.
    #[must_use]
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Blocks until the lock is acquired or `settings.timeout()` elapses.
    ///
    /// Each round purges a detectably stale lock, attempts the atomic
    /// create, and otherwise backs off briefly. Failures to purge are
    /// logged and retried rather than surfaced; a lock that stays stuck
    /// shows up as a timeout naming its holder.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] after `settings.timeout()`,
    /// [`LockError::Cancelled`] when `cancel` fires first, and
    /// [`LockError::Transport`] for session failures.
    pub async fn acquire(
        shell: &dyn RemoteShell,
        settings: &LockSettings,
        fingerprint: &str,
        record: &LockRecord,
        cancel: &CancellationToken,
    ) -> Result<Self, LockError> {
        let dir = settings.lock_dir(fingerprint);
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() > settings.timeout() {
                let holder = Self::holder(shell, &dir).await;
                return Err(LockError::Timeout {
                    seconds: settings.timeout_secs,
                    holder,
                });
            }
            purge_if_stale(shell, &dir, settings).await;
            if try_create(shell, settings, &dir, record).await? {
                return Ok(Self {
                    dir,
                    released: false,
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(LockError::Cancelled),
                () = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    /// One-shot acquisition: purge a stale lock, attempt the atomic create
    /// once, and report [`LockError::Locked`] immediately otherwise.
    ///
    /// # Errors
    ///
    /// [`LockError::Locked`] when held, [`LockError::Transport`] for
    /// session failures.
    pub async fn try_acquire(
        shell: &dyn RemoteShell,
        settings: &LockSettings,
        fingerprint: &str,
        record: &LockRecord,
    ) -> Result<Self, LockError> {
        let dir = settings.lock_dir(fingerprint);
        purge_if_stale(shell, &dir, settings).await;
        if try_create(shell, settings, &dir, record).await? {
            Ok(Self {
                dir,
                released: false,
            })
        } else {
            Err(LockError::Locked {
                holder: Self::holder(shell, &dir).await,
            })
        }
    }

    /// True iff the lock directory exists and is not detectably stale;
    /// equivalently, whether an acquisition would have to wait.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] for session failures.
    pub async fn is_locked(
        shell: &dyn RemoteShell,
        settings: &LockSettings,
        fingerprint: &str,
    ) -> Result<bool, LockError> {
        let dir = settings.lock_dir(fingerprint);
        let probe = shell
            .exec_capture(&format!("test -d {}", quote(&dir)))
            .await
            .map_err(transport)?;
        if !probe.is_success() {
            return Ok(false);
        }
        let stale = read_record(shell, &dir)
            .await
            .is_some_and(|record| record.is_stale(settings.stale()));
        Ok(!stale)
    }

    /// Best-effort human-readable holder description; a placeholder on any
    /// failure.
    pub async fn holder(shell: &dyn RemoteShell, dir: &str) -> String {
        match read_record(shell, dir).await {
            Some(record) => record.holder_label(),
            None => String::from(UNKNOWN_HOLDER),
        }
    }

    /// Removes the lock directory. Releasing twice is a no-op returning
    /// the success of doing nothing.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] when the first removal fails.
    pub async fn release(&mut self, shell: &dyn RemoteShell) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        force_release(shell, &self.dir).await
    }

    /// Removes a lock directory regardless of its holder.
    ///
    /// # Errors
    ///
    /// [`LockError::Transport`] when the removal fails.
    pub async fn force_release(shell: &dyn RemoteShell, dir: &str) -> Result<(), LockError> {
        force_release(shell, dir).await
    }
}

fn info_path(dir: &str) -> String {
    format!("{dir}/info.json")
}

/// Reads and parses the holder record; any failure is `None`.
async fn read_record(shell: &dyn RemoteShell, dir: &str) -> Option<LockRecord> {
    let output = shell
        .exec_capture(&format!("cat {}", quote(&info_path(dir))))
        .await
        .ok()?;
    if !output.is_success() {
        return None;
    }
    serde_json::from_str(&output.stdout).ok()
}

/// Purges the lock at `dir` when its record is detectably stale. A missing
/// or unreadable record is treated as not stale, and removal errors are
/// logged rather than surfaced so a transient hiccup cannot abort an
/// acquisition loop.
async fn purge_if_stale(shell: &dyn RemoteShell, dir: &str, settings: &LockSettings) {
    let Some(record) = read_record(shell, dir).await else {
        return;
    };
    if !record.is_stale(settings.stale()) {
        return;
    }
    log::warn!(
        "removing stale lock {dir} held by {}",
        record.holder_label()
    );
    if let Err(err) = force_release(shell, dir).await {
        log::warn!("could not remove stale lock {dir}: {err}");
    }
}

/// Attempts the atomic directory creation; `Ok(true)` means we now hold
/// the lock and its info file is written.
async fn try_create(
    shell: &dyn RemoteShell,
    settings: &LockSettings,
    dir: &str,
    record: &LockRecord,
) -> Result<bool, LockError> {
    let create = format!(
        "mkdir -p {} && mkdir {} 2>/dev/null",
        quote(settings.base_dir()),
        quote(dir)
    );
    let created = shell.exec_capture(&create).await.map_err(transport)?;
    if !created.is_success() {
        return Ok(false);
    }

    let json = serde_json::to_string(record).map_err(transport)?;
    let write = format!("printf '%s' {} > {}", quote(&json), quote(&info_path(dir)));
    let written = shell.exec_capture(&write).await.map_err(transport)?;
    if !written.is_success() {
        return Err(LockError::Transport {
            message: format!("could not write lock info: {}", written.stderr.trim()),
        });
    }
    Ok(true)
}

async fn force_release(shell: &dyn RemoteShell, dir: &str) -> Result<(), LockError> {
    let removed = shell
        .exec_capture(&format!("rm -rf {}", quote(dir)))
        .await
        .map_err(transport)?;
    if removed.is_success() {
        Ok(())
    } else {
        Err(LockError::Transport {
            message: format!("could not remove {dir}: {}", removed.stderr.trim()),
        })
    }
}
