//! Test-only builders and scripted collaborators.
//!
//! The scripted oracle, session, and interaction handler return queued
//! answers and record every call so tests can assert on what the step
//! executor and orchestrator asked for.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;

use crate::core::budget::CommandBudget;
use crate::core::classifier::classify_command;
use crate::core::types::{CommandOutcome, CommandRecord, Plan, Step, StepCategory, StepId};
use crate::io::interaction::{
    InteractionHandler, InteractionRequest, InteractionResponse, NotifyLevel,
};
use crate::io::oracle::{DecisionOracle, OracleRequest};
use crate::io::session::CommandSession;

/// Deterministic step with no dependencies.
pub fn step(id: StepId) -> Step {
    Step {
        id,
        name: format!("Step {id}"),
        category: StepCategory::Deploy,
        goal: format!("goal {id}"),
        success_criteria: String::new(),
        depends_on: Default::default(),
        hint_commands: Vec::new(),
    }
}

/// Deterministic step depending on `deps`.
pub fn step_with_deps(id: StepId, deps: &[StepId]) -> Step {
    Step {
        depends_on: deps.iter().copied().collect(),
        ..step(id)
    }
}

pub fn plan(steps: Vec<Step>) -> Plan {
    Plan {
        strategy: "test".to_string(),
        steps,
        ..Plan::default()
    }
}

/// Command record with the given result and an empty rationale.
pub fn command_record(command: &str, exit_code: i32, stdout: &str, stderr: &str) -> CommandRecord {
    CommandRecord::new(
        command,
        "",
        classify_command(command),
        outcome(exit_code, stdout, stderr),
        Utc::now(),
    )
}

pub fn outcome(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutcome {
    CommandOutcome {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
        timeout: None,
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 1,
    }
}

/// Raw `execute` response.
pub fn execute(command: &str) -> String {
    json!({"action": "execute", "command": command, "reasoning": "scripted"}).to_string()
}

/// Raw `step_done` response with a summary.
pub fn done(summary: &str) -> String {
    json!({
        "action": "step_done",
        "message": summary,
        "outputs": {"summary": summary, "key_info": {}}
    })
    .to_string()
}

/// Raw `step_done` response with one `key_info` entry.
pub fn done_with(summary: &str, key: &str, value: &str) -> String {
    json!({
        "action": "step_done",
        "message": summary,
        "outputs": {"summary": summary, "key_info": {key: value}}
    })
    .to_string()
}

/// Raw `step_failed` response.
pub fn failed(message: &str) -> String {
    json!({"action": "step_failed", "message": message}).to_string()
}

/// Raw `ask_user` response.
pub fn ask(question: &str, options: &[&str]) -> String {
    json!({"action": "ask_user", "question": question, "options": options}).to_string()
}

/// Oracle returning queued responses, then an optional fallback.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    responses: RefCell<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    requests: RefCell<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: RefCell::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            ..Self::default()
        }
    }

    /// Oracle that answers every call with `response`.
    pub fn repeating(response: impl Into<String>) -> Self {
        Self {
            fallback: Some(response.into()),
            ..Self::default()
        }
    }

    /// Response used once the queue is empty.
    pub fn then_repeat(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Queue a transport error.
    pub fn then_error(self, message: &str) -> Self {
        self.responses
            .borrow_mut()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn then(self, response: impl Into<String>) -> Self {
        self.responses.borrow_mut().push_back(Ok(response.into()));
        self
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl DecisionOracle for ScriptedOracle {
    fn decide(&self, request: &OracleRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("scripted oracle exhausted")),
        }
    }
}

/// Session returning outcomes by rule, queue, or default; never spawns processes.
#[derive(Debug)]
pub struct ScriptedSession {
    queued: RefCell<VecDeque<CommandOutcome>>,
    /// First rule whose pattern is a substring of the command wins.
    rules: Vec<(String, CommandOutcome)>,
    default: CommandOutcome,
    runs: RefCell<Vec<(String, CommandBudget)>>,
}

impl Default for ScriptedSession {
    fn default() -> Self {
        Self {
            queued: RefCell::new(VecDeque::new()),
            rules: Vec::new(),
            default: outcome(0, "ok\n", ""),
            runs: RefCell::new(Vec::new()),
        }
    }
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, pattern: &str, outcome: CommandOutcome) -> Self {
        self.rules.push((pattern.to_string(), outcome));
        self
    }

    pub fn with_default(mut self, outcome: CommandOutcome) -> Self {
        self.default = outcome;
        self
    }

    /// Outcome for the next command, ahead of rules.
    pub fn then(self, outcome: CommandOutcome) -> Self {
        self.queued.borrow_mut().push_back(outcome);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.runs.borrow().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn budgets(&self) -> Vec<CommandBudget> {
        self.runs.borrow().iter().map(|(_, b)| *b).collect()
    }
}

impl CommandSession for ScriptedSession {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn run(&self, command: &str, budget: CommandBudget) -> CommandOutcome {
        self.runs.borrow_mut().push((command.to_string(), budget));
        if let Some(outcome) = self.queued.borrow_mut().pop_front() {
            return outcome;
        }
        self.rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map_or_else(|| self.default.clone(), |(_, outcome)| outcome.clone())
    }
}

/// Interaction handler with queued replies; unanswered questions time out.
#[derive(Debug, Default)]
pub struct ScriptedInteraction {
    replies: RefCell<VecDeque<InteractionResponse>>,
    questions: RefCell<Vec<InteractionRequest>>,
    notifications: RefCell<Vec<(String, NotifyLevel)>>,
}

impl ScriptedInteraction {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(
                replies
                    .into_iter()
                    .map(|r| InteractionResponse::Answer(r.into()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn then_cancel(self) -> Self {
        self.replies
            .borrow_mut()
            .push_back(InteractionResponse::Cancelled);
        self
    }

    pub fn questions(&self) -> Vec<InteractionRequest> {
        self.questions.borrow().clone()
    }

    pub fn notifications(&self) -> Vec<(String, NotifyLevel)> {
        self.notifications.borrow().clone()
    }
}

impl InteractionHandler for ScriptedInteraction {
    fn ask(&self, request: &InteractionRequest) -> InteractionResponse {
        self.questions.borrow_mut().push(request.clone());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or(InteractionResponse::TimedOut)
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        self.notifications
            .borrow_mut()
            .push((message.to_string(), level));
    }
}
