//! Shared deterministic types for the deployment core.
//!
//! These types define stable contracts between the orchestrator, the step
//! executor and the persisted run log. They hold no I/O handles and serialize
//! with snake_case tags so the run log stays stable across versions.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identifier used for dependency references between steps.
pub type StepId = u32;

/// Informational step category; the core never branches on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepCategory {
    Prerequisite,
    Setup,
    Build,
    #[default]
    Deploy,
    Verify,
}

impl StepCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            StepCategory::Prerequisite => "prerequisite",
            StepCategory::Setup => "setup",
            StepCategory::Build => "build",
            StepCategory::Deploy => "deploy",
            StepCategory::Verify => "verify",
        }
    }
}

/// One atomic, dependency-ordered unit of the deployment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    #[serde(default)]
    pub category: StepCategory,
    #[serde(alias = "description")]
    pub goal: String,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub depends_on: BTreeSet<StepId>,
    /// Advisory commands shown to the oracle; never required.
    #[serde(default)]
    pub hint_commands: Vec<String>,
}

impl Step {
    /// Success criteria text, synthesized from the name when the plan left it empty.
    pub fn criteria(&self) -> String {
        if self.success_criteria.trim().is_empty() {
            format!("Complete: {}", self.name)
        } else {
            self.success_criteria.clone()
        }
    }
}

/// Ordered deployment plan produced by the external planning phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }
}

/// Lifecycle of a step: `Pending -> Running -> {Success, Failed, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Overall status of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Aborted,
}

/// Whether a command only inspects the target or may change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Diagnostic,
    Mutating,
}

/// Which timeout terminated a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutKind {
    Idle,
    Total,
}

/// Exit code reported for a command killed by the idle timeout.
pub const IDLE_TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit code reported for a command killed by the total timeout.
pub const TOTAL_TIMEOUT_EXIT_CODE: i32 = -2;

/// Result of running one command through a session.
///
/// Timeouts and launch failures are data here, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timeout: Option<TimeoutKind>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.timeout.is_none()
    }

    /// Outcome for a command that could not be started at all.
    pub fn launch_failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            timeout: None,
            stdout_truncated: 0,
            stderr_truncated: 0,
            duration_ms: 0,
        }
    }
}

/// One executed command in a step's trace. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    #[serde(default)]
    pub reasoning: String,
    pub kind: CommandKind,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutKind>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: usize,
    #[serde(default)]
    pub stderr_truncated: usize,
    #[serde(default)]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(
        command: impl Into<String>,
        reasoning: impl Into<String>,
        kind: CommandKind,
        outcome: CommandOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            command: command.into(),
            reasoning: reasoning.into(),
            kind,
            exit_code: outcome.exit_code,
            timeout: outcome.timeout,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            stdout_truncated: outcome.stdout_truncated,
            stderr_truncated: outcome.stderr_truncated,
            duration_ms: outcome.duration_ms,
            timestamp,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.timeout.is_none()
    }

    /// Combined stdout and stderr, used for output similarity.
    pub fn combined_output(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// A problem a step ran into and how it got past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIssue {
    pub issue: String,
    pub resolution: String,
}

/// Structured output a step produces on success.
///
/// This is the only channel through which a step's effects reach later steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutputs {
    pub summary: String,
    #[serde(default)]
    pub key_info: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_issues: Vec<ResolvedIssue>,
}

/// Terminal record of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<StepOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub commands_executed: usize,
    #[serde(default)]
    pub iterations: u32,
}

impl StepResult {
    pub fn success(
        step_id: StepId,
        outputs: StepOutputs,
        commands: usize,
        iterations: u32,
    ) -> Self {
        Self {
            step_id,
            status: StepStatus::Success,
            outputs: Some(outputs),
            error: None,
            commands_executed: commands,
            iterations,
        }
    }

    pub fn failed(
        step_id: StepId,
        error: impl Into<String>,
        commands: usize,
        iterations: u32,
    ) -> Self {
        Self {
            step_id,
            status: StepStatus::Failed,
            outputs: None,
            error: Some(error.into()),
            commands_executed: commands,
            iterations,
        }
    }

    pub fn skipped(step_id: StepId, reason: impl Into<String>) -> Self {
        Self {
            step_id,
            status: StepStatus::Skipped,
            outputs: None,
            error: Some(reason.into()),
            commands_executed: 0,
            iterations: 0,
        }
    }
}

/// Who raised a question to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSource {
    Oracle,
    LoopIntervention,
}

/// A question asked during a step and the reply received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInteraction {
    pub source: InteractionSource,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// `None` when the handler was cancelled or timed out.
    pub reply: Option<String>,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

/// Audit record for one intra-step compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionEvent {
    pub iteration: u32,
    pub commands_folded: usize,
    pub commands_kept: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub timestamp: DateTime<Utc>,
}

/// Classification of a step's recent command trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    None,
    DirectRepeat,
    ErrorLoop,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopKind::None => "none",
            LoopKind::DirectRepeat => "direct_repeat",
            LoopKind::ErrorLoop => "error_loop",
        };
        f.write_str(label)
    }
}

/// Result of one loop-detector check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetection {
    pub kind: LoopKind,
    pub confidence: f64,
    pub evidence: Vec<String>,
    /// Trace indices of the commands involved.
    pub indices: Vec<usize>,
}

impl LoopDetection {
    pub fn none() -> Self {
        Self {
            kind: LoopKind::None,
            confidence: 0.0,
            evidence: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn is_loop(&self) -> bool {
        self.kind != LoopKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_accepts_description_alias_and_defaults() {
        let step: Step = serde_json::from_str(
            r#"{"id": 3, "name": "Install deps", "description": "install packages"}"#,
        )
        .expect("parse step");
        assert_eq!(step.goal, "install packages");
        assert_eq!(step.category, StepCategory::Deploy);
        assert!(step.depends_on.is_empty());
        assert_eq!(step.criteria(), "Complete: Install deps");
    }

    #[test]
    fn timeouts_count_as_failures_even_with_zero_exit() {
        let outcome = CommandOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            timeout: Some(TimeoutKind::Idle),
            stdout_truncated: 0,
            stderr_truncated: 0,
            duration_ms: 10,
        };
        assert!(!outcome.succeeded());
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let json = serde_json::to_string(&StepStatus::Skipped).expect("serialize");
        assert_eq!(json, "\"skipped\"");
        let json = serde_json::to_string(&LoopKind::DirectRepeat).expect("serialize");
        assert_eq!(json, "\"direct_repeat\"");
    }
}
