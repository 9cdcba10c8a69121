//! End-to-end orchestrator runs against scripted collaborators.
//!
//! Covers the failure policy (retry, skip, abort, unanswered prompts),
//! dependency skipping, summary propagation, and the persisted run log.

use std::fs;
use std::path::Path;

use deployer::core::state::{RepositoryInfo, TargetInfo};
use deployer::core::types::{RunStatus, StepStatus};
use deployer::io::config::DeployerConfig;
use deployer::orchestrator::{ABORT_OPTION, Orchestrator, RETRY_OPTION, RunOutcome, SKIP_OPTION};
use deployer::test_support::{
    ScriptedInteraction, ScriptedOracle, ScriptedSession, done, done_with, execute, failed, outcome,
    plan, step, step_with_deps,
};
use serde_json::Value;

fn config(log_dir: &Path) -> DeployerConfig {
    let mut cfg = DeployerConfig::default();
    cfg.log.dir = log_dir.to_path_buf();
    cfg
}

fn run(
    cfg: &DeployerConfig,
    oracle: &ScriptedOracle,
    session: &ScriptedSession,
    handler: &ScriptedInteraction,
    steps: Vec<deployer::core::types::Step>,
) -> RunOutcome {
    let target = TargetInfo {
        mode: "local".to_string(),
        ..TargetInfo::default()
    };
    let repository = RepositoryInfo {
        url: "https://example.com/acme/shop.git".to_string(),
        deploy_dir: "/srv/shop".to_string(),
        description: String::new(),
    };
    Orchestrator::new(oracle, session, handler, cfg, target, repository)
        .run(&plan(steps))
        .expect("run")
}

fn read_log(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read log")).expect("parse log")
}

#[test]
fn successful_run_writes_complete_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([
        execute("docker --version"),
        done("docker present"),
        execute("docker compose up -d"),
        done("stack running"),
    ]);
    let session = ScriptedSession::new();
    let outcome = run(
        &cfg,
        &oracle,
        &session,
        &ScriptedInteraction::default(),
        vec![step(1), step_with_deps(2, &[1])],
    );

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(session.commands(), vec!["docker --version", "docker compose up -d"]);
    assert!(outcome.log_path.starts_with(temp.path()));
    let file_name = outcome
        .log_path
        .file_name()
        .and_then(|name| name.to_str())
        .expect("file name");
    assert!(file_name.starts_with("deploy_shop_"), "{file_name}");

    let log = read_log(&outcome.log_path);
    assert_eq!(log["status"], "success");
    assert_eq!(log["repo_url"], "https://example.com/acme/shop.git");
    assert_eq!(log["steps"].as_array().expect("steps").len(), 2);
    assert_eq!(log["steps"][0]["status"], "success");
    assert_eq!(log["steps"][0]["commands"][0]["command"], "docker --version");
    assert_eq!(log["summary"]["successful_steps"], 2);
    assert_eq!(log["summary"]["total_commands"], 2);
    assert!(log["end_time"].is_string());
    assert_eq!(
        log["execution_summary"]["completed_actions"][1],
        "[DEPLOY] Step 2: stack running"
    );
}

#[test]
fn skipped_failure_blocks_dependents_without_calling_oracle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([failed("port 80 in use")]);
    let handler = ScriptedInteraction::new([SKIP_OPTION]);
    let outcome = run(
        &cfg,
        &oracle,
        &ScriptedSession::new(),
        &handler,
        vec![step(1), step_with_deps(2, &[1])],
    );

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(oracle.calls(), 1);
    let results = &outcome.context.step_results;
    assert_eq!(results[&1].status, StepStatus::Skipped);
    assert_eq!(results[&2].status, StepStatus::Skipped);
    assert!(
        results[&2]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("dependency 1 not satisfied"))
    );

    let question = &handler.questions()[0];
    assert!(question.question.contains("port 80 in use"));
    assert_eq!(question.options, vec![RETRY_OPTION, SKIP_OPTION, ABORT_OPTION]);

    let log = read_log(&outcome.log_path);
    assert_eq!(log["steps"][0]["status"], "failed");
    assert_eq!(log["steps"][1]["status"], "skipped");
    assert_eq!(log["summary"]["skipped_steps"], 1);
}

#[test]
fn retry_gets_a_fresh_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([
        execute("make build"),
        failed("compiler missing"),
        done("built after retry"),
    ]);
    let handler = ScriptedInteraction::new([RETRY_OPTION]);
    let outcome = run(&cfg, &oracle, &ScriptedSession::new(), &handler, vec![step(1)]);

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.context.step_results[&1].status, StepStatus::Success);
    // The second attempt starts with an empty history.
    let retry_request = &oracle.requests()[2];
    assert_eq!(retry_request.iteration, 1);
    assert!(!retry_request.history.contains("make build"));

    let log = read_log(&outcome.log_path);
    let attempts: Vec<(u64, &str)> = log["steps"]
        .as_array()
        .expect("steps")
        .iter()
        .map(|s| {
            (
                s["attempt"].as_u64().expect("attempt"),
                s["status"].as_str().expect("status"),
            )
        })
        .collect();
    assert_eq!(attempts, vec![(1, "failed"), (2, "success")]);
}

#[test]
fn abort_choice_fails_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([failed("disk full")]);
    let handler = ScriptedInteraction::new([ABORT_OPTION]);
    let outcome = run(
        &cfg,
        &oracle,
        &ScriptedSession::new(),
        &handler,
        vec![step(1), step(2)],
    );

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(oracle.calls(), 1);
    assert!(!outcome.context.step_results.contains_key(&2));
    assert_eq!(read_log(&outcome.log_path)["status"], "failed");
}

#[test]
fn unanswered_failure_prompt_aborts_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([failed("unreachable registry")]);
    let outcome = run(
        &cfg,
        &oracle,
        &ScriptedSession::new(),
        &ScriptedInteraction::default(),
        vec![step(1)],
    );

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(read_log(&outcome.log_path)["status"], "aborted");
}

#[test]
fn retry_option_disappears_once_retries_are_spent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(temp.path());
    cfg.max_step_retries = 1;
    let oracle = ScriptedOracle::repeating(failed("still broken"));
    let handler = ScriptedInteraction::new([RETRY_OPTION, RETRY_OPTION]);
    let outcome = run(&cfg, &oracle, &ScriptedSession::new(), &handler, vec![step(1)]);

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(oracle.calls(), 2);
    let questions = handler.questions();
    assert_eq!(questions.len(), 2);
    assert!(questions[0].options.iter().any(|o| o == RETRY_OPTION));
    assert_eq!(questions[1].options, vec![SKIP_OPTION, ABORT_OPTION]);
}

#[test]
fn outputs_flow_into_summary_and_shared_data() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([
        done_with("switched to compose", "strategy", "compose"),
        done("services up"),
    ]);
    let outcome = run(
        &cfg,
        &oracle,
        &ScriptedSession::new(),
        &ScriptedInteraction::default(),
        vec![step(1), step_with_deps(2, &[1])],
    );

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.summary.strategy, "compose");
    assert_eq!(outcome.summary.resolved_issues.len(), 1);
    assert_eq!(
        outcome.context.shared_data.get("strategy").map(String::as_str),
        Some("compose")
    );
    let second_prompt = &oracle.requests()[1].prompt;
    assert!(second_prompt.contains("Step 1: switched to compose"));
}

#[test]
fn completed_actions_stay_capped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(temp.path());
    cfg.summary.max_completed_actions = 2;
    let oracle = ScriptedOracle::repeating(done("ok"));
    let outcome = run(
        &cfg,
        &oracle,
        &ScriptedSession::new(),
        &ScriptedInteraction::default(),
        (1..=4).map(step).collect(),
    );

    let actions: Vec<&str> = outcome
        .summary
        .completed_actions
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(actions, vec!["[DEPLOY] Step 3: ok", "[DEPLOY] Step 4: ok"]);
}

#[test]
fn failed_commands_are_logged_and_the_step_continues() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = config(temp.path());
    let oracle = ScriptedOracle::new([
        execute("systemctl status app"),
        execute("systemctl restart app"),
    ])
    .then_repeat(done("service restarted"));
    let session = ScriptedSession::new().with_rule("status", outcome(3, "", "inactive (dead)"));
    let outcome = run(
        &cfg,
        &oracle,
        &session,
        &ScriptedInteraction::default(),
        vec![step(1)],
    );

    assert_eq!(outcome.status, RunStatus::Success);
    let log = read_log(&outcome.log_path);
    let commands = &log["steps"][0]["commands"];
    assert_eq!(commands[0]["exit_code"], 3);
    assert_eq!(commands[0]["success"], false);
    assert_eq!(commands[0]["stderr"], "inactive (dead)");
    assert_eq!(commands[1]["success"], true);
    assert_eq!(log["steps"][0]["iterations"], 3);
}
