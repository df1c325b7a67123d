//! Smoke tests -- verify the binary runs and the main flows work end to end.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

/// Config pointing all state at `dir`, with OS scheduling switched off.
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let toml = format!(
        "[storage]\ndata_dir = {:?}\n\n[scheduler]\nbackend = \"none\"\n\n[logging]\nlevel = \"warn\"\n",
        dir.display().to_string()
    );
    std::fs::write(&path, toml).unwrap();
    path
}

fn cadence(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cadence").unwrap();
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("cadence")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("missed-run catch-up"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("cadence")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cadence"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["task", "add", "--help"][..],
        &["schedule", "enable", "--help"],
        &["catchup", "run", "--help"],
        &["history", "--help"],
        &["run", "--help"],
    ] {
        Command::cargo_bin("cadence")
            .unwrap()
            .args(args)
            .assert()
            .success();
    }
}

#[test]
fn test_catchup_run_requires_names_or_all() {
    Command::cargo_bin("cadence")
        .unwrap()
        .args(["catchup", "run"])
        .assert()
        .failure();
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("cadence")
        .unwrap()
        .args(["--config", "/nonexistent/cadence.toml", "task", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_add_list_and_remove_task() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    cadence(&config)
        .args(["task", "add", "nightly", "--schedule", "30 2 * * *", "--executor", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task 'nightly' added."));

    cadence(&config)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly"))
        .stdout(predicate::str::contains("every day at 02:30"));

    cadence(&config)
        .args(["task", "add", "nightly", "--schedule", "30 2 * * *", "--executor", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    cadence(&config)
        .args(["task", "remove", "nightly"])
        .assert()
        .success();

    cadence(&config)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks found."));
}

#[test]
fn test_invalid_schedule_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    cadence(&config)
        .args(["task", "add", "broken", "--schedule", "61 * * * *", "--executor", "true"])
        .assert()
        .failure();
}

#[test]
fn test_enable_on_unsupported_platform_is_a_clear_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    cadence(&config)
        .args(["task", "add", "hourly", "--schedule", "@hourly", "--executor", "true"])
        .assert()
        .success();

    cadence(&config)
        .args(["schedule", "enable", "hourly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not supported on this platform"));
}

#[cfg(unix)]
#[test]
fn test_manual_runs_are_recorded() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    cadence(&config)
        .args(["task", "add", "ok", "--schedule", "@daily", "--executor", "true"])
        .assert()
        .success();
    cadence(&config)
        .args(["task", "add", "bad", "--schedule", "@daily", "--executor", "exit 3"])
        .assert()
        .success();

    cadence(&config)
        .args(["run", "ok"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok: completed (manual)"));
    cadence(&config).args(["run", "bad"]).assert().failure();

    cadence(&config)
        .args(["history", "--task", "ok"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("bad").not());

    let history = std::fs::read_to_string(dir.path().join("history.json")).unwrap();
    let records: serde_json::Value = serde_json::from_str(&history).unwrap();
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    let bad = records.iter().find(|r| r["taskName"] == "bad").unwrap();
    assert_eq!(bad["status"], "failed");
    assert_eq!(bad["triggeredBy"], "manual");
}

#[test]
fn test_scheduled_trigger_for_unknown_task_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path());

    cadence(&config)
        .args(["run", "ghost", "--scheduled"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
