//! Unit tests for output buffering, mode handling, and status tracking.

use std::time::Duration;

use chrono::Utc;
use rstest::rstest;

use super::*;
use crate::task::{Task, TaskError, TaskId, TaskResult};

fn task(name: &str) -> Task {
    Task::new(TaskId::new(name, 0), "echo hi")
}

fn result(name: &str, exit_code: i32) -> TaskResult {
    let now = Utc::now();
    TaskResult {
        id: TaskId::new(name, 0),
        host: String::from("alpha"),
        exit_code,
        error: None,
        started: now,
        finished: now,
        output: String::from("line\n"),
        command: String::from("echo hi"),
    }
}

#[test]
fn buffer_accumulates_lines_until_the_cap() {
    let mut buffer = TaskBuffer::new();
    buffer.push_line("one");
    buffer.push_line("two");
    assert_eq!(buffer.contents(), "one\ntwo\n");
    assert!(!buffer.truncated());
}

#[test]
fn buffer_truncates_once_with_a_sentinel() {
    let mut buffer = TaskBuffer::new();
    buffer.push_line("kept");
    buffer.push_line(&"x".repeat(MAX_TASK_OUTPUT));
    assert!(buffer.truncated());
    assert!(buffer.contents().starts_with("kept\n"));
    assert!(buffer.contents().ends_with(&format!("{TRUNCATION_NOTICE}\n")));

    let before = buffer.contents().len();
    buffer.push_line("dropped");
    assert_eq!(buffer.contents().len(), before, "no growth after overflow");
    assert!(!buffer.contents().contains("dropped"));
}

#[rstest]
#[case("progress", OutputMode::Progress)]
#[case("stream", OutputMode::Stream)]
#[case("verbose", OutputMode::Verbose)]
#[case("quiet", OutputMode::Quiet)]
fn mode_parses_and_displays(#[case] raw: &str, #[case] expected: OutputMode) {
    let parsed: OutputMode = raw.parse().expect("mode should parse");
    assert_eq!(parsed, expected);
    assert_eq!(parsed.to_string(), raw);
}

#[test]
fn mode_rejects_unknown_names() {
    let err = "loud".parse::<OutputMode>().expect_err("should fail");
    assert!(err.contains("loud"));
}

#[test]
fn mode_deserialises_from_config() {
    #[derive(serde::Deserialize)]
    struct Wrapper {
        output: OutputMode,
    }
    let wrapper: Wrapper = serde_yaml::from_str("output: stream").expect("yaml parses");
    assert_eq!(wrapper.output, OutputMode::Stream);
}

#[test]
fn progress_downgrades_to_quiet_off_a_terminal() {
    // The test harness captures stdout, so this cannot be a terminal.
    let manager = OutputManager::new(OutputMode::Progress);
    assert_eq!(manager.mode(), OutputMode::Quiet);
}

#[test]
fn statuses_follow_the_lifecycle() {
    let manager = OutputManager::new(OutputMode::Quiet);
    let batch = vec![task("build"), task("test")];
    manager.init_tasks(&batch);
    let build = TaskId::new("build", 0);

    assert_eq!(manager.status(&build), Some(TaskStatus::Pending));
    manager.task_syncing(&build, "alpha");
    assert_eq!(manager.status(&build), Some(TaskStatus::Syncing));
    manager.task_executing(&build);
    assert_eq!(manager.status(&build), Some(TaskStatus::Running));
    manager.task_completed(&result("build", 0));
    assert_eq!(manager.status(&build), Some(TaskStatus::Passed));

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.get("build#0"), Some(&TaskStatus::Passed));
    assert_eq!(snapshot.get("test#0"), Some(&TaskStatus::Pending));
}

#[test]
fn requeue_resets_to_pending_and_failure_marks_failed() {
    let manager = OutputManager::new(OutputMode::Quiet);
    manager.init_tasks(&[task("flaky")]);
    let id = TaskId::new("flaky", 0);

    manager.task_syncing(&id, "alpha");
    manager.task_requeued(&id, "alpha");
    assert_eq!(manager.status(&id), Some(TaskStatus::Pending));

    manager.task_syncing(&id, "beta");
    manager.task_executing(&id);
    manager.task_completed(&result("flaky", 2));
    assert_eq!(manager.status(&id), Some(TaskStatus::Failed));
}

#[test]
fn completed_with_error_is_failed_despite_zero_exit() {
    let manager = OutputManager::new(OutputMode::Quiet);
    manager.init_tasks(&[task("odd")]);
    let mut failed = result("odd", 0);
    failed.error = Some(TaskError::AllHostsDown);
    manager.task_completed(&failed);
    assert_eq!(
        manager.status(&TaskId::new("odd", 0)),
        Some(TaskStatus::Failed)
    );
}

#[rstest]
#[case(Duration::from_millis(2340), "2.3s")]
#[case(Duration::from_millis(400), "0.4s")]
#[case(Duration::from_secs(65), "1m05.0s")]
#[case(Duration::from_secs(600), "10m00.0s")]
fn durations_render_compactly(#[case] duration: Duration, #[case] expected: &str) {
    assert_eq!(human_duration(duration), expected);
}

#[test]
fn close_is_safe_without_progress_state() {
    let manager = OutputManager::new(OutputMode::Quiet);
    manager.init_tasks(&[task("a")]);
    manager.close();
    manager.close();
}
