//! Batch log persistence and retention.
//!
//! After a run, each task's captured output lands in its own log file under
//! a timestamped run directory, next to a machine-readable `summary.json`.
//! The sweeper keeps the newest run directories and prunes the rest, so
//! saved logs never grow without bound.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use crate::task::{BatchResult, TaskResult};

/// Characters replaced in file names derived from task and batch names.
const FORBIDDEN: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Replaces path-hostile characters with `-`.
#[must_use]
pub fn sanitise_name(name: &str) -> String {
    name.chars()
        .map(|ch| if FORBIDDEN.contains(&ch) { '-' } else { ch })
        .collect()
}

/// Errors raised while persisting run logs.
#[derive(Debug, Error)]
pub enum ReportError {
    /// A file or directory under the log root could not be written.
    #[error("could not write {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> ReportError {
    ReportError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[derive(Serialize)]
struct SummaryTask<'a> {
    id: String,
    host: &'a str,
    exit_code: i32,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration_secs: f64,
    command: &'a str,
}

impl<'a> SummaryTask<'a> {
    fn from_result(result: &'a TaskResult) -> Self {
        Self {
            id: result.id.key(),
            host: &result.host,
            exit_code: result.exit_code,
            success: result.success(),
            error: result.error.as_ref().map(ToString::to_string),
            duration_secs: result.duration().as_secs_f64(),
            command: &result.command,
        }
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    passed: usize,
    failed: usize,
    duration_secs: f64,
    hosts: Vec<&'a str>,
    tasks: Vec<SummaryTask<'a>>,
}

/// Writes run logs and prunes old ones.
#[derive(Clone, Debug)]
pub struct ReportWriter {
    log_dir: Utf8PathBuf,
    keep_runs: usize,
}

impl ReportWriter {
    /// Creates a writer rooted at `log_dir`, keeping the newest
    /// `keep_runs` run directories (`0` disables pruning).
    #[must_use]
    pub fn new(log_dir: Utf8PathBuf, keep_runs: usize) -> Self {
        Self { log_dir, keep_runs }
    }

    /// Persists one batch: per-task logs plus `summary.json`, under
    /// `<log_dir>/<batch>-<YYYYMMDD-HHMMSS>/`. Returns the run directory.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Io`] when any file cannot be written.
    pub fn save(
        &self,
        batch_name: &str,
        batch: &BatchResult,
        started: DateTime<Local>,
    ) -> Result<Utf8PathBuf, ReportError> {
        let run_dir = self.log_dir.join(format!(
            "{}-{}",
            sanitise_name(batch_name),
            started.format("%Y%m%d-%H%M%S")
        ));
        fs::create_dir_all(&run_dir).map_err(|err| io_error(&run_dir, &err))?;

        for result in &batch.results {
            let file = run_dir.join(format!(
                "{}_{}.log",
                sanitise_name(&result.id.name),
                result.id.index
            ));
            let mut contents = format!("$ {}\n{}", result.command, result.output);
            if let Some(ref error) = result.error {
                contents.push_str(&format!("error: {error}\n"));
            }
            fs::write(&file, contents).map_err(|err| io_error(&file, &err))?;
        }

        let summary = Summary {
            passed: batch.passed,
            failed: batch.failed,
            duration_secs: batch.duration.as_secs_f64(),
            hosts: batch.hosts_used.iter().map(String::as_str).collect(),
            tasks: batch.results.iter().map(SummaryTask::from_result).collect(),
        };
        let summary_path = run_dir.join("summary.json");
        let rendered = serde_json::to_string_pretty(&summary).map_err(|err| ReportError::Io {
            path: summary_path.clone(),
            message: err.to_string(),
        })?;
        fs::write(&summary_path, rendered).map_err(|err| io_error(&summary_path, &err))?;

        Ok(run_dir)
    }

    /// Removes run directories beyond the retention count, newest first by
    /// name (the embedded timestamp makes names sort chronologically).
    /// Returns how many were removed; individual removal failures are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Io`] when the log root cannot be listed.
    pub fn sweep(&self) -> Result<usize, ReportError> {
        if self.keep_runs == 0 || !self.log_dir.exists() {
            return Ok(0);
        }
        let entries = fs::read_dir(&self.log_dir).map_err(|err| io_error(&self.log_dir, &err))?;
        let mut run_dirs: Vec<Utf8PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
            .collect();
        run_dirs.sort();
        run_dirs.reverse();

        let mut removed = 0;
        for dir in run_dirs.iter().skip(self.keep_runs) {
            match fs::remove_dir_all(dir) {
                Ok(()) => removed += 1,
                Err(err) => log::warn!("could not prune old run logs at {dir}: {err}"),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskError, TaskId};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn batch() -> BatchResult {
        let started = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).single();
        let started = started.unwrap_or_else(Utc::now);
        let results = vec![
            TaskResult {
                id: TaskId::new("build", 0),
                host: String::from("alpha"),
                exit_code: 0,
                error: None,
                started,
                finished: started,
                output: String::from("ok\n"),
                command: String::from("make build"),
            },
            TaskResult {
                id: TaskId::new("lint/strict", 0),
                host: String::from("alpha"),
                exit_code: 1,
                error: Some(TaskError::Timeout { seconds: 30 }),
                started,
                finished: started,
                output: String::new(),
                command: String::from("make lint"),
            },
        ];
        BatchResult::from_results(results, std::time::Duration::from_secs(2))
    }

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir")
    }

    #[test]
    fn sanitise_replaces_path_hostile_characters() {
        assert_eq!(sanitise_name("lint/strict"), "lint-strict");
        assert_eq!(sanitise_name(r#"a\b:c*d?e"f<g>h|i"#), "a-b-c-d-e-f-g-h-i");
        assert_eq!(sanitise_name("plain-name_1"), "plain-name_1");
    }

    #[test]
    fn save_writes_task_logs_and_summary() {
        let dir = TempDir::new().expect("temp dir");
        let writer = ReportWriter::new(utf8(&dir), 5);
        let stamp = Local.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).single();
        let run_dir = writer
            .save("ci", &batch(), stamp.unwrap_or_else(Local::now))
            .expect("save should succeed");

        assert!(run_dir.join("build_0.log").is_file());
        assert!(run_dir.join("lint-strict_0.log").is_file());
        let summary =
            std::fs::read_to_string(run_dir.join("summary.json")).expect("summary exists");
        let parsed: serde_json::Value = serde_json::from_str(&summary).expect("valid json");
        assert_eq!(parsed["passed"], 1);
        assert_eq!(parsed["failed"], 1);
        assert_eq!(parsed["tasks"][0]["id"], "build#0");
    }

    #[test]
    fn sweep_keeps_newest_runs() {
        let dir = TempDir::new().expect("temp dir");
        let root = utf8(&dir);
        for stamp in ["20260101-000000", "20260102-000000", "20260103-000000"] {
            std::fs::create_dir_all(root.join(format!("ci-{stamp}"))).expect("mkdir");
        }
        let writer = ReportWriter::new(root.clone(), 2);
        let removed = writer.sweep().expect("sweep should succeed");

        assert_eq!(removed, 1);
        assert!(!root.join("ci-20260101-000000").exists());
        assert!(root.join("ci-20260103-000000").exists());
    }

    #[test]
    fn sweep_disabled_with_zero_retention() {
        let dir = TempDir::new().expect("temp dir");
        let root = utf8(&dir);
        std::fs::create_dir_all(root.join("ci-20260101-000000")).expect("mkdir");
        let writer = ReportWriter::new(root.clone(), 0);
        assert_eq!(writer.sweep().expect("sweep should succeed"), 0);
        assert!(root.join("ci-20260101-000000").exists());
    }
}
