//! Integration tests for running turns and reading history through the CLI.

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_run_then_history_shows_tool_result() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args([
            "run",
            "--session",
            "1:cli",
            r#"/call task_create {"title": "Fix bug", "project_id": 7}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("task_create succeeded"))
        .stdout(predicate::str::contains("\"task_id\":42"));

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["history", "1:cli"])
        .assert()
        .success()
        .stdout(predicate::str::contains("### Turn 1"))
        .stdout(predicate::str::contains("tool: task_create"))
        .stdout(predicate::str::contains("assistant: task_create succeeded"));

    assert!(home.path().join("checkpoints").join("1:cli").is_dir());
}

#[test]
fn test_history_json_lists_turns_in_order() {
    let home = TempDir::new().unwrap();
    for message in ["first", "second"] {
        cargo_bin_cmd!("zentro")
            .env("ZENTRO_HOME", home.path())
            .args(["run", message])
            .assert()
            .success();
    }

    let output = cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["history", "api", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let turns: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let requests: Vec<&str> = turns
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["request"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(requests, vec!["first", "second"]);
}

#[test]
fn test_unknown_session_has_no_turns() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["history", "nobody"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No turns in session nobody"));
}

#[test]
fn test_invalid_session_key_fails() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["run", "--session", "../escape", "hi"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid session key"));
}

#[test]
fn test_memory_flag_writes_nothing() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["--memory", "run", "hello"])
        .assert()
        .success();
    assert!(!home.path().join("checkpoints").exists());
}

#[test]
fn test_stream_prints_reply() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["stream", "/call task_get {\"task_id\": 40}"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task_get succeeded"))
        .stderr(predicate::str::contains("→ task_get"));
}

#[test]
fn test_new_session_key_carries_user() {
    cargo_bin_cmd!("zentro")
        .args(["new-session", "--user", "5"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("5:"));
}

#[test]
fn test_tools_lists_catalog() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("task_create"))
        .stdout(predicate::str::contains("sprint_get_active"));
}

#[test]
fn test_broken_config_is_reported() {
    let home = TempDir::new().unwrap();
    fs::write(home.path().join("config.toml"), "max_tool_iterations = \"many\"").unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", home.path())
        .args(["run", "hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load config"));
}
