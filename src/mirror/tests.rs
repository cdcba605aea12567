//! Unit tests for the mirror, driving a stand-in transfer tool.

use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use super::*;
use crate::test_support::{ScriptedExec, ScriptedShell};

fn host(name: &str, targets: &[&str]) -> HostConfig {
    HostConfig {
        name: name.to_owned(),
        targets: targets.iter().map(|&t| t.to_owned()).collect(),
        dir: String::from("~/work/proj"),
        port: None,
        setup: Vec::new(),
    }
}

fn settings() -> MirrorSettings {
    MirrorSettings {
        exclude: vec![String::from(".git"), String::from("target")],
        preserve: vec![String::from("node_modules")],
        extra_flags: vec![String::from("--compress-level=3")],
        ..MirrorSettings::default()
    }
}

/// Writes an executable stand-in for the transfer tool and returns its path.
fn fake_rsync(dir: &TempDir, script: &str) -> Utf8PathBuf {
    let path = dir.path().join("rsync");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("stat script").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod script");
    Utf8PathBuf::from_path_buf(path).expect("utf8 path")
}

#[test]
fn build_args_cover_exclude_preserve_and_extras() {
    let mirror = RsyncMirror::new(settings());
    let args = mirror.build_args(
        Some("ssh -S /tmp/ctl"),
        Utf8Path::new("/home/me/proj"),
        "dev@10.0.0.5:work/proj",
    );

    assert_eq!(args.first().map(String::as_str), Some("-az"));
    assert!(args.contains(&String::from("--delete")));
    let excludes: Vec<usize> = args
        .iter()
        .enumerate()
        .filter(|(_, a)| *a == "--exclude")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(excludes.len(), 2);
    assert!(args.contains(&String::from("P node_modules")));
    assert!(args.contains(&String::from("--compress-level=3")));
    assert!(args.contains(&String::from("-e")));
    assert!(args.contains(&String::from("ssh -S /tmp/ctl")));
    // Trailing-slash source copies contents, not the directory itself.
    assert!(args.contains(&String::from("/home/me/proj/")));
    assert_eq!(
        args.last().map(String::as_str),
        Some("dev@10.0.0.5:work/proj")
    );
}

#[test]
fn build_args_without_rsh_for_local_destinations() {
    let mirror = RsyncMirror::new(MirrorSettings::default());
    let args = mirror.build_args(None, Utf8Path::new("/src"), "/dst");
    assert!(!args.contains(&String::from("-e")));
}

#[tokio::test]
async fn loopback_hosts_are_a_no_op() {
    let mirror = RsyncMirror::new(MirrorSettings {
        rsync_bin: String::from("definitely-not-installed-anywhere"),
        ..MirrorSettings::default()
    });
    let shell = ScriptedShell::new("localhost");
    let outcome = mirror
        .sync(
            &shell,
            &host("here", &["localhost"]),
            Utf8Path::new("/src"),
            None,
        )
        .await;
    assert!(outcome.is_ok());
    assert!(shell.executed().is_empty(), "no remote commands expected");
}

#[tokio::test]
async fn missing_tool_is_reported_as_unavailable() {
    let mirror = RsyncMirror::new(MirrorSettings {
        rsync_bin: String::from("definitely-not-installed-anywhere"),
        ..MirrorSettings::default()
    });
    let shell = ScriptedShell::new("dev@10.0.0.5");
    let err = mirror
        .sync(
            &shell,
            &host("fast", &["dev@10.0.0.5"]),
            Utf8Path::new("/src"),
            None,
        )
        .await
        .expect_err("missing tool should fail");
    assert!(matches!(err, MirrorError::Unavailable { .. }));
}

#[tokio::test]
async fn remote_mkdir_failure_fails_the_sync() {
    let scripts = TempDir::new().expect("temp dir");
    let mirror = RsyncMirror::new(MirrorSettings {
        rsync_bin: fake_rsync(&scripts, "exit 0").into_string(),
        ..MirrorSettings::default()
    });
    let shell = ScriptedShell::new("dev@10.0.0.5");
    shell.add_rule(
        "mkdir ",
        ScriptedExec {
            exit_code: 1,
            stderr_lines: vec![String::from("mkdir: permission denied")],
            ..ScriptedExec::success()
        },
    );
    let err = mirror
        .sync(
            &shell,
            &host("fast", &["dev@10.0.0.5"]),
            Utf8Path::new("/src"),
            None,
        )
        .await
        .expect_err("mkdir failure should fail");
    let MirrorError::Failed { host, message } = err else {
        panic!("expected Failed, got {err:?}");
    };
    assert_eq!(host, "fast");
    assert!(message.contains("permission denied"), "message: {message}");
}

#[tokio::test]
async fn transfer_success_and_failure_propagate() {
    let scripts = TempDir::new().expect("temp dir");
    let source = TempDir::new().expect("source dir");
    let source = Utf8PathBuf::from_path_buf(source.path().to_path_buf()).expect("utf8");
    let target_host = host("fast", &["dev@10.0.0.5"]);

    let ok_mirror = RsyncMirror::new(MirrorSettings {
        rsync_bin: fake_rsync(&scripts, "exit 0").into_string(),
        ..MirrorSettings::default()
    });
    let shell = ScriptedShell::with_standard_prep("dev@10.0.0.5");
    assert!(
        ok_mirror
            .sync(&shell, &target_host, &source, None)
            .await
            .is_ok()
    );

    let failing = RsyncMirror::new(MirrorSettings {
        rsync_bin: fake_rsync(&scripts, "echo 'rsync: connection unexpectedly closed' >&2; exit 12")
            .into_string(),
        ..MirrorSettings::default()
    });
    let shell = ScriptedShell::with_standard_prep("dev@10.0.0.5");
    let err = failing
        .sync(&shell, &target_host, &source, None)
        .await
        .expect_err("non-zero transfer should fail");
    let MirrorError::Failed { message, .. } = err else {
        panic!("expected Failed");
    };
    assert!(message.contains("status 12"), "message: {message}");
    assert!(message.contains("connection unexpectedly closed"));
}
