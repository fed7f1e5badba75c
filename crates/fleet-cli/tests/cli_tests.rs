//! CLI integration tests

use std::process::{Command, Output};

fn fleetctl(args: &[&str]) -> Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "fleet-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = fleetctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("fleet usage tracker"), "Should show app description");
    assert!(stdout.contains("instances"), "Should show instances command");
    assert!(stdout.contains("usage"), "Should show usage command");
    assert!(stdout.contains("config"), "Should show config command");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = fleetctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("fleetctl"), "Should show binary name");
}

#[test]
fn test_usage_history_help() {
    let output = fleetctl(&["usage", "history", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "usage history help should succeed");
    for flag in ["--cluster", "--start", "--end", "--period", "--csv"] {
        assert!(stdout.contains(flag), "Should show {} option", flag);
    }
}

#[test]
fn test_usage_current_help() {
    let output = fleetctl(&["usage", "current", "--help"]);

    assert!(output.status.success(), "usage current help should succeed");
}

#[test]
fn test_config_help() {
    let output = fleetctl(&["config", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "config help should succeed");
    assert!(stdout.contains("set-api-url"), "Should show set-api-url command");
    assert!(stdout.contains("show"), "Should show show command");
}

#[test]
fn test_invalid_format_is_rejected() {
    let output = fleetctl(&["--format", "yaml", "instances"]);

    assert!(!output.status.success(), "Unknown format should fail");
}

#[test]
fn test_unreachable_daemon_fails() {
    let output = fleetctl(&["--api-url", "http://127.0.0.1:1", "instances"]);

    assert!(!output.status.success(), "Unreachable daemon should fail");
}
