//! Dual-timeout behavior of local sessions against real `bash` children.

use std::time::{Duration, Instant};

use deployer::core::budget::CommandBudget;
use deployer::core::types::{IDLE_TIMEOUT_EXIT_CODE, TOTAL_TIMEOUT_EXIT_CODE, TimeoutKind};
use deployer::io::session::{CommandSession, LocalSession};

fn session(dir: &std::path::Path) -> LocalSession {
    LocalSession::new("bash", dir, 200_000)
}

#[test]
fn silent_command_hits_idle_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let started = Instant::now();
    let outcome = session(temp.path()).run(
        "echo started; sleep 30",
        CommandBudget::from_secs(20, 1),
    );

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.timeout, Some(TimeoutKind::Idle));
    assert_eq!(outcome.exit_code, IDLE_TIMEOUT_EXIT_CODE);
    assert!(outcome.stdout.contains("started"));
    assert!(!outcome.succeeded());
}

#[test]
fn chatty_command_hits_total_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let started = Instant::now();
    let outcome = session(temp.path()).run(
        "while true; do echo tick; sleep 0.2; done",
        CommandBudget::from_secs(2, 10),
    );

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.timeout, Some(TimeoutKind::Total));
    assert_eq!(outcome.exit_code, TOTAL_TIMEOUT_EXIT_CODE);
    assert!(outcome.stdout.matches("tick").count() >= 2);
}

#[test]
fn exit_code_and_streams_are_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outcome = session(temp.path()).run(
        "echo out; echo err >&2; exit 3",
        CommandBudget::from_secs(10, 5),
    );

    assert_eq!(outcome.timeout, None);
    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.stdout.trim(), "out");
    assert_eq!(outcome.stderr.trim(), "err");
}
