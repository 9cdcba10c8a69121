//! Run-scoped and step-scoped mutable execution state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::types::{
    CommandRecord, CompressionEvent, Step, StepId, StepResult, StepStatus, UserInteraction,
};

/// Where the deployment runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// `local` or `ssh`.
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Free-form host facts produced by external analysis.
    #[serde(default)]
    pub description: String,
}

/// What is being deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub url: String,
    pub deploy_dir: String,
    /// Free-form repository facts produced by external analysis.
    #[serde(default)]
    pub description: String,
}

impl RepositoryInfo {
    /// Last path segment of the repository URL without a `.git` suffix.
    pub fn project_name(&self) -> String {
        let trimmed = self.url.trim_end_matches('/');
        let last = trimmed
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(trimmed)
            .trim_end_matches(".git");
        if last.is_empty() {
            "project".to_string()
        } else {
            last.to_string()
        }
    }
}

/// Run-scoped state owned by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployContext {
    pub target: TargetInfo,
    pub repository: RepositoryInfo,
    /// Facts steps published for later steps.
    pub shared_data: IndexMap<String, String>,
    /// Latest result per step; drives dependency resolution.
    pub step_results: BTreeMap<StepId, StepResult>,
}

impl DeployContext {
    pub fn new(target: TargetInfo, repository: RepositoryInfo) -> Self {
        Self {
            target,
            repository,
            shared_data: IndexMap::new(),
            step_results: BTreeMap::new(),
        }
    }

    /// First dependency of `step` that has not succeeded, if any.
    pub fn dependency_blocker(&self, step: &Step) -> Option<StepId> {
        step.depends_on.iter().copied().find(|dep| {
            self.step_results
                .get(dep)
                .is_none_or(|result| result.status != StepStatus::Success)
        })
    }
}

/// Per-attempt mutable state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub step_id: StepId,
    pub step_name: String,
    /// 1-based attempt number; retries get a fresh context.
    pub attempt: u32,
    pub status: StepStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Full command trace; never pruned by compaction.
    pub commands: Vec<CommandRecord>,
    pub interactions: Vec<UserInteraction>,
    pub escalation_level: u32,
    /// Exploration intensity for the next oracle call.
    pub temperature: f64,
    /// Directive injected into the next oracle call, then cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    /// Operator reply to the oracle's last question, shown once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_history: Option<String>,
    /// Commands before this index are represented by `compacted_history`.
    pub compacted_through: usize,
    pub compression_events: Vec<CompressionEvent>,
    /// Remaining commands to run before loop detection resumes.
    pub detection_pause: u32,
    pub started_at: DateTime<Utc>,
}

impl StepContext {
    pub fn new(step: &Step, attempt: u32, max_iterations: u32, temperature: f64) -> Self {
        Self {
            step_id: step.id,
            step_name: step.name.clone(),
            attempt,
            status: StepStatus::Pending,
            iteration: 0,
            max_iterations,
            commands: Vec::new(),
            interactions: Vec::new(),
            escalation_level: 0,
            temperature,
            reflection: None,
            pending_reply: None,
            compacted_history: None,
            compacted_through: 0,
            compression_events: Vec::new(),
            detection_pause: 0,
            started_at: Utc::now(),
        }
    }

    /// Commands not yet folded into the compacted history.
    pub fn recent_commands(&self) -> &[CommandRecord] {
        let start = self.compacted_through.min(self.commands.len());
        &self.commands[start..]
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}
