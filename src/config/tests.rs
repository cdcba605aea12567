//! Unit tests for configuration loading and batch resolution.

use camino::Utf8Path;
use rstest::rstest;

use super::*;

fn parse(yaml: &str) -> Config {
    let config: Config = serde_yaml::from_str(yaml).expect("yaml should parse");
    config.validate().expect("config should validate");
    config
}

const BASIC: &str = r#"
tasks:
  build:
    cmd: cargo build
  test:
    cmd: cargo test
    deps: [build]
  lint:
    cmd: cargo clippy
hosts:
  - name: fast
    targets: ["dev@10.0.0.5"]
    dir: ~/work/rr
  - name: slow
    targets: ["dev@backup.example.com", "dev@backup2.example.com"]
    dir: ~/work/rr
    setup:
      - source ~/.cargo/env
"#;

#[test]
fn parses_tasks_hosts_and_defaults() {
    let config = parse(BASIC);
    assert_eq!(config.tasks.len(), 3);
    assert_eq!(config.hosts.len(), 2);
    assert_eq!(config.settings.output, OutputMode::Progress);
    assert_eq!(config.settings.keep_runs, 10);
    assert_eq!(config.lock.timeout_secs, 300);
    let slow = config.host("slow").expect("slow host exists");
    assert_eq!(slow.targets.len(), 2);
    assert_eq!(slow.setup.len(), 1);
}

#[test]
fn dep_variants_accept_strings_and_parallel_groups() {
    let config = parse(
        r#"
tasks:
  a:
    cmd: echo a
  b:
    cmd: echo b
  c:
    cmd: echo c
    deps:
      - a
      - parallel: [b]
"#,
    );
    let spec = &config.tasks["c"];
    assert_eq!(
        spec.deps,
        vec![
            Dep::Single(String::from("a")),
            Dep::Parallel {
                parallel: vec![String::from("b")]
            }
        ]
    );
}

#[test]
fn resolve_expands_deps_ahead_of_requester() {
    let config = parse(BASIC);
    let batch = config
        .resolve_batch(&[String::from("test")])
        .expect("batch should resolve");
    let names: Vec<&str> = batch.iter().map(|task| task.id.name.as_str()).collect();
    assert_eq!(names, ["build", "test"]);
}

#[test]
fn resolve_deduplicates_by_name() {
    let config = parse(BASIC);
    let batch = config
        .resolve_batch(&[String::from("test"), String::from("build")])
        .expect("batch should resolve");
    let names: Vec<&str> = batch.iter().map(|task| task.id.name.as_str()).collect();
    assert_eq!(names, ["build", "test"]);
}

#[test]
fn resolve_empty_request_selects_every_task() {
    let config = parse(BASIC);
    let batch = config.resolve_batch(&[]).expect("batch should resolve");
    assert_eq!(batch.len(), 3);
}

#[test]
fn resolve_rejects_unknown_task() {
    let config = parse(BASIC);
    let err = config
        .resolve_batch(&[String::from("deploy")])
        .expect_err("unknown task should fail");
    assert_eq!(
        err,
        ConfigError::UnknownTask {
            name: String::from("deploy")
        }
    );
}

#[test]
fn resolve_detects_dependency_cycles() {
    let config: Config = serde_yaml::from_str(
        r#"
tasks:
  a:
    cmd: echo a
    deps: [b]
  b:
    cmd: echo b
    deps: [a]
"#,
    )
    .expect("yaml should parse");
    let err = config
        .resolve_batch(&[String::from("a")])
        .expect_err("cycle should fail");
    assert!(matches!(err, ConfigError::DependencyCycle { .. }));
}

#[test]
fn validate_rejects_dep_on_undeclared_task() {
    let config: Config = serde_yaml::from_str(
        r#"
tasks:
  a:
    cmd: echo a
    deps: [ghost]
"#,
    )
    .expect("yaml should parse");
    let err = config.validate().expect_err("missing dep should fail");
    assert_eq!(
        err,
        ConfigError::UnknownTask {
            name: String::from("ghost")
        }
    );
}

#[rstest]
#[case("", "targets: [\"a@b\"]", "declares no remote directory")]
#[case("~/rr", "targets: []", "declares no targets")]
fn validate_rejects_incomplete_hosts(
    #[case] dir: &str,
    #[case] targets: &str,
    #[case] expected: &str,
) {
    let yaml = format!(
        "tasks: {{}}\nhosts:\n  - name: h\n    {targets}\n    dir: \"{dir}\"\n"
    );
    let config: Config = serde_yaml::from_str(&yaml).expect("yaml should parse");
    let err = config.validate().expect_err("validation should fail");
    assert!(
        err.to_string().contains(expected),
        "unexpected error: {err}"
    );
}

#[test]
fn select_hosts_preserves_requested_order() {
    let config = parse(BASIC);
    let hosts = config
        .select_hosts(Some(&[String::from("slow"), String::from("fast")]))
        .expect("hosts should resolve");
    let names: Vec<&str> = hosts.iter().map(|host| host.name.as_str()).collect();
    assert_eq!(names, ["slow", "fast"]);
}

#[test]
fn select_hosts_rejects_unknown_names() {
    let config = parse(BASIC);
    let err = config
        .select_hosts(Some(&[String::from("missing")]))
        .expect_err("unknown host should fail");
    assert_eq!(
        err,
        ConfigError::UnknownHost {
            name: String::from("missing")
        }
    );
}

#[rstest]
#[case(&["localhost"], true)]
#[case(&["me@127.0.0.1"], true)]
#[case(&["::1"], true)]
#[case(&["me@10.0.0.5"], false)]
#[case(&["localhost", "me@10.0.0.5"], false)]
fn loopback_detection(#[case] targets: &[&str], #[case] expected: bool) {
    let host = HostConfig {
        name: String::from("h"),
        targets: targets.iter().map(|&t| t.to_owned()).collect(),
        dir: String::from("~/rr"),
        port: None,
        setup: Vec::new(),
    };
    assert_eq!(host.is_loopback(), expected);
}

#[test]
fn fingerprint_is_stable_and_path_safe() {
    let a = project_fingerprint(Utf8Path::new("/home/me/proj"));
    let b = project_fingerprint(Utf8Path::new("/home/me/proj"));
    let c = project_fingerprint(Utf8Path::new("/home/you/proj"));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.starts_with("proj-"));
    assert!(
        a.chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    );
}

#[test]
fn load_reports_missing_file() {
    let err = Config::load(Utf8Path::new("/nonexistent/rr.yaml"))
        .expect_err("missing file should fail");
    assert!(matches!(err, ConfigError::NotFound { .. }));
}
