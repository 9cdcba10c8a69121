//! CLI tests for `deployer check-plan` and `deployer exec`.
//!
//! Spawns the deployer binary and verifies exit codes for valid and invalid
//! plans and for commands run through a local session.

use std::process::Command;

use deployer::exit_codes;
use deployer::io::plan_store::write_plan;
use deployer::test_support::{plan, step, step_with_deps};

fn deployer(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_deployer"));
    cmd.current_dir(dir);
    cmd
}

#[test]
fn check_plan_accepts_valid_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("plan.json");
    write_plan(&path, &plan(vec![step(1), step_with_deps(2, &[1])])).expect("write plan");

    let output = deployer(temp.path())
        .args(["check-plan", "--plan"])
        .arg(&path)
        .output()
        .expect("deployer check-plan");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2. [DEPLOY] Step 2 (id 2) after 1"), "{stdout}");
}

#[test]
fn check_plan_rejects_forward_dependency() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("plan.json");
    write_plan(&path, &plan(vec![step_with_deps(1, &[2]), step(2)])).expect("write plan");

    let output = deployer(temp.path())
        .args(["check-plan", "--plan"])
        .arg(&path)
        .output()
        .expect("deployer check-plan");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("plan invariants failed"));
}

#[test]
fn check_plan_reports_missing_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = deployer(temp.path())
        .args(["check-plan", "--plan", "missing.toml"])
        .status()
        .expect("deployer check-plan");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn exec_runs_command_locally() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = deployer(temp.path())
        .args(["exec", "--", "echo", "hello"])
        .output()
        .expect("deployer exec");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
}

#[test]
fn exec_reports_failed_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = deployer(temp.path())
        .args(["exec", "--", "false"])
        .status()
        .expect("deployer exec");
    assert_eq!(status.code(), Some(exit_codes::FAILED));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("deployer.toml"), "max_iterations_per_step = 0\n")
        .expect("write config");
    let status = deployer(temp.path())
        .args(["exec", "--", "true"])
        .status()
        .expect("deployer exec");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
