use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn test_config_path_command() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_init_creates_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created config at"));

    let contents = fs::read_to_string(&config_path).unwrap();
    assert!(contents.contains("max_tool_iterations = 10"));
    assert!(contents.contains("[checkpoint]"));
}

#[test]
fn test_config_init_fails_if_exists() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), "# existing config").unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_config_set_updates_value() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .success();
    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", dir.path())
        .args(["config", "set", "checkpoint.retain_versions", "9"])
        .assert()
        .success();

    let contents = fs::read_to_string(&config_path).unwrap();
    assert!(contents.contains("retain_versions = 9"));
    assert!(contents.contains("# Versions kept per session"));
}

#[test]
fn test_config_set_rejects_wrong_type() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("zentro")
        .env("ZENTRO_HOME", dir.path())
        .args(["config", "set", "max_tool_iterations", "lots"])
        .assert()
        .failure();
    assert!(!dir.path().join("config.toml").exists());
}
