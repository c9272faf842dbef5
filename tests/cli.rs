use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn quota_cmd(data: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("quota-engine").unwrap();
    cmd.env_remove("QUOTA_CONFIG_PATH")
        .env_remove("QUOTA_DEFAULT_TIER")
        .env("NO_COLOR", "1")
        .arg("--data-dir")
        .arg(data.path());
    cmd
}

fn json_of(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().unwrap();
    assert!(output.status.success(), "command failed: {:?}", output);
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_check_fresh_account_is_allowed() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["check", "--account", "alice", "--kind", "resumeUploads"])
        .assert()
        .success()
        .stdout(predicate::str::contains("resumeUploads allowed: 0 used of 3"));
}

#[test]
fn test_track_then_check_is_denied() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["track", "-a", "alice", "-k", "resumeUploads", "-q", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total 3"));

    quota_cmd(&data)
        .args(["check", "-a", "alice", "-k", "resumeUploads"])
        .assert()
        .success()
        .stdout(predicate::str::contains("denied"))
        .stdout(predicate::str::contains("monthly limit of 3 resume uploads"))
        .stdout(predicate::str::contains("Upgrade to pro"));
}

#[test]
fn test_admit_clamps_and_delete_keeps_consumed() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["admit", "-a", "alice", "-q", "60", "--run-id", "run-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("admitted 50 of 60, dropped 10"))
        .stdout(predicate::str::contains("weekly limit reached"));

    quota_cmd(&data)
        .args(["delete-run", "-a", "alice", "--run-id", "run-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed"));

    let stats = json_of(quota_cmd(&data).args(["stats", "-a", "alice"]));
    assert_eq!(stats["weekly"]["consumed"], 50);
    assert_eq!(stats["weekly"]["remaining"], 0);
    assert_eq!(stats["weekly"]["runs"][0]["deleted"], true);
}

#[test]
fn test_check_json_lists_every_kind() {
    let data = tempfile::tempdir().unwrap();
    let result = json_of(quota_cmd(&data).args([
        "check",
        "-a",
        "alice",
        "-k",
        "coverLetters",
        "-k",
        "jobDiscovery",
    ]));
    assert_eq!(result["allowed"], true);
    assert_eq!(result["decisions"].as_array().unwrap().len(), 2);
    assert_eq!(result["decisions"][1]["window"], "weekly");
}

#[test]
fn test_pro_tier_flag_changes_limits() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["check", "-a", "bob", "-t", "pro", "-k", "jobImports"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 used of 200"));
}

#[test]
fn test_unknown_kind_fails() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["check", "-a", "alice", "-k", "telepathy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown action kind 'telepathy'"));
}

#[test]
fn test_rate_reports_rejections() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["rate", "-a", "alice", "-n", "105"])
        .assert()
        .success()
        .stdout(predicate::str::contains("100 of 105 requests allowed"));
}

#[test]
fn test_simulate_applies_daily_clamp() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["simulate", "-a", "alice", "-b", "8,8", "--hours-between", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kept 10, dropped 6"))
        .stdout(predicate::str::contains("daily limit of 10 reached"));
}

#[test]
fn test_invalid_account_id_is_rejected() {
    let data = tempfile::tempdir().unwrap();
    quota_cmd(&data)
        .args(["track", "-a", "../escape", "-k", "jobImports"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not recorded"));
}
