//! Lock behaviour against a real filesystem, driven through the loopback
//! shell. These cover the properties the scripted unit tests cannot: the
//! atomicity primitive is an actual `mkdir`, and the info file lands on
//! disk byte-exactly.

use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use rr::lock::{Lock, LockError, LockRecord, LockSettings};
use rr::shell::LocalShell;

fn settings(dir: &TempDir) -> LockSettings {
    LockSettings {
        dir: dir.path().to_string_lossy().into_owned(),
        timeout_secs: 5,
        stale_secs: 600,
    }
}

fn record() -> LockRecord {
    LockRecord::for_current_process(Some(String::from("rr run test")))
}

#[tokio::test]
async fn acquire_creates_the_directory_and_exact_info_file() {
    let base = TempDir::new().expect("temp dir");
    let settings = settings(&base);
    let shell = LocalShell::new();
    let holder = record();

    let mut lock = Lock::acquire(&shell, &settings, "P", &holder, &CancellationToken::new())
        .await
        .expect("acquire should succeed");

    let lock_dir = base.path().join("rr-P.lock");
    assert_eq!(lock.dir(), lock_dir.to_string_lossy());
    assert!(lock_dir.is_dir());

    let on_disk = std::fs::read_to_string(lock_dir.join("info.json")).expect("info file");
    let expected = serde_json::to_string(&holder).expect("serialise");
    assert_eq!(on_disk, expected, "info file is written byte-exactly");

    lock.release(&shell).await.expect("release should succeed");
    assert!(!lock_dir.exists(), "release removes the directory tree");
}

#[tokio::test]
async fn try_acquire_against_a_held_lock_refuses_immediately() {
    let base = TempDir::new().expect("temp dir");
    let settings = settings(&base);
    let shell = LocalShell::new();
    let holder = record();

    let mut held = Lock::acquire(&shell, &settings, "P", &holder, &CancellationToken::new())
        .await
        .expect("first acquire should succeed");

    let started = Instant::now();
    let err = Lock::try_acquire(&shell, &settings, "P", &record())
        .await
        .expect_err("second acquire should refuse");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "refusal must be immediate"
    );
    let LockError::Locked { holder: label } = err else {
        panic!("expected Locked, got {err:?}");
    };
    assert_eq!(label, holder.holder_label());

    held.release(&shell).await.expect("release");
}

#[tokio::test]
async fn a_stale_lock_is_purged_and_replaced() {
    let base = TempDir::new().expect("temp dir");
    let settings = settings(&base);
    let shell = LocalShell::new();

    // Pre-state: a lock whose record is an hour old against a ten-minute
    // staleness threshold.
    let lock_dir = base.path().join("rr-P.lock");
    std::fs::create_dir_all(&lock_dir).expect("pre-create lock dir");
    let mut old = record();
    old.started = Utc::now() - chrono::Duration::hours(1);
    std::fs::write(
        lock_dir.join("info.json"),
        serde_json::to_string(&old).expect("serialise"),
    )
    .expect("write stale info");

    let fresh = record();
    let lock = Lock::acquire(&shell, &settings, "P", &fresh, &CancellationToken::new())
        .await
        .expect("acquire should purge the stale lock");
    assert_eq!(lock.dir(), lock_dir.to_string_lossy());

    let on_disk = std::fs::read_to_string(lock_dir.join("info.json")).expect("info file");
    let replaced: LockRecord = serde_json::from_str(&on_disk).expect("parse");
    assert_eq!(replaced, fresh, "the old holder record is gone");
}

#[tokio::test]
async fn is_locked_mirrors_acquire_availability() {
    let base = TempDir::new().expect("temp dir");
    let settings = settings(&base);
    let shell = LocalShell::new();

    assert!(
        !Lock::is_locked(&shell, &settings, "P")
            .await
            .expect("probe should succeed"),
        "nothing locked yet"
    );

    let mut lock = Lock::acquire(&shell, &settings, "P", &record(), &CancellationToken::new())
        .await
        .expect("acquire");
    assert!(
        Lock::is_locked(&shell, &settings, "P")
            .await
            .expect("probe should succeed")
    );

    lock.release(&shell).await.expect("release");
    assert!(
        !Lock::is_locked(&shell, &settings, "P")
            .await
            .expect("probe should succeed")
    );
}

#[tokio::test]
async fn force_release_removes_a_foreign_lock() {
    let base = TempDir::new().expect("temp dir");
    let settings = settings(&base);
    let shell = LocalShell::new();

    let _held = Lock::acquire(&shell, &settings, "P", &record(), &CancellationToken::new())
        .await
        .expect("acquire");
    let dir = settings.lock_dir("P");
    Lock::force_release(&shell, &dir)
        .await
        .expect("force release");
    assert!(!std::path::Path::new(&dir).exists());
}
