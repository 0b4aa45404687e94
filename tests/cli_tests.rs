//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a command for the pdexec-coord binary
fn coord_cmd() -> Command {
    let mut cmd = Command::cargo_bin("pdexec-coord").unwrap();
    cmd.env_remove("PDEXEC_CONFIG");
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    coord_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("version"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    coord_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pdexec-coord"))
        .stdout(predicate::str::contains("Build Information"))
        .stdout(predicate::str::contains("Git Hash"))
        .stdout(predicate::str::contains("Target"));
}

#[test]
fn test_short_version_flag() {
    coord_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pdexec-coord"));
}

// ─────────────────────────────────────────────────────────────────
// Config Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_default() {
    coord_cmd()
        .arg("config")
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("[server]"))
        .stdout(predicate::str::contains("[lock]"))
        .stdout(predicate::str::contains("[dispatch]"))
        .stdout(predicate::str::contains("[worker]"))
        .stdout(predicate::str::contains("[logging]"));
}

#[test]
fn test_config_validate_default() {
    coord_cmd()
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_nonexistent_file() {
    coord_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg("/nonexistent/path/coord.toml")
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_config_init_help() {
    coord_cmd()
        .arg("config")
        .arg("init")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialize"))
        .stdout(predicate::str::contains("--path"))
        .stdout(predicate::str::contains("--force"));
}

// ─────────────────────────────────────────────────────────────────
// Serve / Worker / Submit Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_serve_help() {
    coord_cmd()
        .arg("serve")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn test_worker_help() {
    coord_cmd()
        .arg("worker")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--server"))
        .stdout(predicate::str::contains("--name"));
}

#[test]
fn test_serve_with_invalid_config() {
    coord_cmd()
        .arg("serve")
        .arg("--config")
        .arg("/nonexistent/coord.toml")
        .assert()
        .failure();
}

#[test]
fn test_submit_without_server() {
    coord_cmd()
        .arg("--quiet")
        .arg("submit")
        .arg("noop")
        .arg("--server")
        .arg("ws://127.0.0.1:1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_submit_rejects_bad_args_json() {
    coord_cmd()
        .arg("--quiet")
        .arg("submit")
        .arg("sleep")
        .arg("--args")
        .arg("{not json")
        .arg("--server")
        .arg("ws://127.0.0.1:1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON"));
}

// ─────────────────────────────────────────────────────────────────
// Verbosity Flag Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_verbose_flag() {
    coord_cmd().arg("-v").arg("version").assert().success();
}

#[test]
fn test_very_verbose_flag() {
    coord_cmd().arg("-vv").arg("version").assert().success();
}

#[test]
fn test_quiet_flag() {
    coord_cmd().arg("--quiet").arg("version").assert().success();
}

// ─────────────────────────────────────────────────────────────────
// Error Handling Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_command() {
    coord_cmd()
        .arg("unknown-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_missing_subcommand() {
    coord_cmd().assert().failure();
}
