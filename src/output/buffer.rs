//! Bounded per-task output buffer.

/// Hard cap on buffered output per task.
pub const MAX_TASK_OUTPUT: usize = 1024 * 1024;

/// Sentinel appended exactly once when a task exceeds the cap.
pub const TRUNCATION_NOTICE: &str = "… output truncated (exceeded 1MB) …";

/// Accumulates a task's combined output up to [`MAX_TASK_OUTPUT`].
///
/// On overflow the buffer stops growing and [`TRUNCATION_NOTICE`] becomes
/// its final line; everything buffered before the overflow is kept.
#[derive(Debug, Default)]
pub struct TaskBuffer {
    data: String,
    truncated: bool,
}

impl TaskBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one line, unless the buffer has already overflowed.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.data.len() + line.len() + 1 > MAX_TASK_OUTPUT {
            self.truncated = true;
            self.data.push_str(TRUNCATION_NOTICE);
            self.data.push('\n');
            return;
        }
        self.data.push_str(line);
        self.data.push('\n');
    }

    /// True once the cap has been hit.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Buffered contents, newline-terminated per line.
    #[must_use]
    pub fn contents(&self) -> &str {
        &self.data
    }

    /// Consumes the buffer into its contents.
    #[must_use]
    pub fn into_string(self) -> String {
        self.data
    }
}
