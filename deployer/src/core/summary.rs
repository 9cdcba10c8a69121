//! Bounded, run-scoped digest of completed work.
//!
//! Every successful step merges its [`StepOutputs`] here. All collections are
//! capped with oldest-first eviction so the oracle-facing context stays the
//! same size no matter how long the run is.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{ResolvedIssue, Step, StepOutputs};

/// Caps applied to the execution summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryLimits {
    pub max_completed_actions: usize,
    pub max_resolved_issues: usize,
    pub max_environment_keys: usize,
    /// Entries kept from a single step's `key_info`.
    pub max_key_info_entries: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_completed_actions: 15,
            max_resolved_issues: 5,
            max_environment_keys: 30,
            max_key_info_entries: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub project_name: String,
    pub deploy_dir: String,
    pub strategy: String,
    pub completed_actions: VecDeque<String>,
    pub resolved_issues: VecDeque<ResolvedIssue>,
    /// Insertion-ordered; re-setting a key moves it to the newest position.
    pub environment: IndexMap<String, String>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip)]
    limits: SummaryLimits,
}

impl ExecutionSummary {
    pub fn new(
        project_name: impl Into<String>,
        deploy_dir: impl Into<String>,
        strategy: impl Into<String>,
        limits: SummaryLimits,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            deploy_dir: deploy_dir.into(),
            strategy: strategy.into(),
            completed_actions: VecDeque::new(),
            resolved_issues: VecDeque::new(),
            environment: IndexMap::new(),
            last_updated: Utc::now(),
            limits,
        }
    }

    pub fn limits(&self) -> &SummaryLimits {
        &self.limits
    }

    /// Merge a successful step's outputs.
    pub fn merge_step(&mut self, step: &Step, outputs: &StepOutputs) {
        let action = format!(
            "[{}] {}: {}",
            step.category.as_str().to_uppercase(),
            step.name,
            outputs.summary
        );
        debug!(step_id = step.id, action = %action, "merging step outputs");
        push_capped(
            &mut self.completed_actions,
            action,
            self.limits.max_completed_actions,
        );
        for (key, value) in &outputs.key_info {
            self.remember(key, value);
        }
        for issue in &outputs.resolved_issues {
            push_capped(
                &mut self.resolved_issues,
                issue.clone(),
                self.limits.max_resolved_issues,
            );
        }
        self.last_updated = Utc::now();
    }

    pub fn record_resolved_issue(
        &mut self,
        issue: impl Into<String>,
        resolution: impl Into<String>,
    ) {
        push_capped(
            &mut self.resolved_issues,
            ResolvedIssue {
                issue: issue.into(),
                resolution: resolution.into(),
            },
            self.limits.max_resolved_issues,
        );
        self.last_updated = Utc::now();
    }

    /// Set an environment fact, evicting the oldest key beyond the cap.
    pub fn remember(&mut self, key: &str, value: &str) {
        self.environment.shift_remove(key);
        self.environment.insert(key.to_string(), value.to_string());
        while self.environment.len() > self.limits.max_environment_keys {
            if let Some((evicted, _)) = self.environment.shift_remove_index(0) {
                debug!(key = %evicted, "evicted environment key");
            }
        }
        self.last_updated = Utc::now();
    }

    /// Switch strategy and keep a record of the change.
    pub fn update_strategy(&mut self, strategy: impl Into<String>) {
        let strategy = strategy.into();
        let previous = std::mem::replace(&mut self.strategy, strategy.clone());
        self.record_resolved_issue(
            format!("Strategy change required from {previous}"),
            format!("Switched to {strategy}"),
        );
    }

    /// Markdown rendering used in oracle prompts.
    pub fn prompt_context(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("- Project: {}\n", self.project_name));
        out.push_str(&format!("- Deploy directory: {}\n", self.deploy_dir));
        if !self.strategy.is_empty() {
            out.push_str(&format!("- Strategy: {}\n", self.strategy));
        }

        out.push_str("\nCompleted actions:\n");
        if self.completed_actions.is_empty() {
            out.push_str("- (none yet)\n");
        }
        for action in &self.completed_actions {
            out.push_str(&format!("- {action}\n"));
        }

        if !self.environment.is_empty() {
            out.push_str("\nKnown environment:\n");
            for (key, value) in &self.environment {
                out.push_str(&format!("- {key}: {value}\n"));
            }
        }

        if !self.resolved_issues.is_empty() {
            out.push_str("\nResolved issues:\n");
            for issue in &self.resolved_issues {
                out.push_str(&format!("- {} -> {}\n", issue.issue, issue.resolution));
            }
        }
        out
    }
}

fn push_capped<T>(items: &mut VecDeque<T>, item: T, cap: usize) {
    items.push_back(item);
    while items.len() > cap {
        items.pop_front();
    }
}
