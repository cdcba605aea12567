//! Holder metadata persisted inside the lock directory.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of the lock's `info.json`, identifying the holding invocation.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct LockRecord {
    /// User that acquired the lock.
    pub user: String,
    /// Machine the acquiring process ran on.
    pub hostname: String,
    /// Acquisition time, RFC 3339.
    pub started: DateTime<Utc>,
    /// Process id of the acquirer.
    pub pid: u32,
    /// Invoking command line, omitted when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl LockRecord {
    /// Describes the current process as a lock holder.
    #[must_use]
    pub fn for_current_process(command: Option<String>) -> Self {
        Self {
            user: whoami::username(),
            hostname: whoami::fallible::hostname()
                .unwrap_or_else(|_| String::from("unknown")),
            started: Utc::now(),
            pid: std::process::id(),
            command,
        }
    }

    /// Human-readable holder description: `user@host (pid N)`.
    #[must_use]
    pub fn holder_label(&self) -> String {
        format!("{}@{} (pid {})", self.user, self.hostname, self.pid)
    }

    /// True when the record is older than `threshold`. A zero threshold
    /// disables staleness; a future-dated record is never stale.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        if threshold.is_zero() {
            return false;
        }
        (Utc::now() - self.started)
            .to_std()
            .is_ok_and(|age| age > threshold)
    }
}
