//! Persisted run log: one JSON document per deployment, rewritten atomically
//! after every command so a crash loses at most the in-flight command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::state::{RepositoryInfo, StepContext, TargetInfo};
use crate::core::summary::ExecutionSummary;
use crate::core::types::{
    CommandKind, CommandRecord, CompressionEvent, Plan, RunStatus, Step, StepCategory, StepId,
    StepOutputs, StepResult, StepStatus, TimeoutKind, UserInteraction,
};
use crate::io::config::{DeployerConfig, write_atomic};

pub const RUN_LOG_VERSION: u32 = 2;

/// One command as persisted, with capped output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLog {
    pub command: String,
    pub reasoning: String,
    pub kind: CommandKind,
    pub success: bool,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutKind>,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped from stdout, at capture time and for the log.
    #[serde(default)]
    pub stdout_truncated: usize,
    #[serde(default)]
    pub stderr_truncated: usize,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl CommandLog {
    fn from_record(record: &CommandRecord, stdout_bytes: usize, stderr_bytes: usize) -> Self {
        let (stdout, stdout_cut) = cap_text(&record.stdout, stdout_bytes);
        let (stderr, stderr_cut) = cap_text(&record.stderr, stderr_bytes);
        Self {
            command: record.command.clone(),
            reasoning: record.reasoning.clone(),
            kind: record.kind,
            success: record.succeeded(),
            exit_code: record.exit_code,
            timeout: record.timeout,
            stdout,
            stderr,
            stdout_truncated: record.stdout_truncated + stdout_cut,
            stderr_truncated: record.stderr_truncated + stderr_cut,
            duration_ms: record.duration_ms,
            timestamp: record.timestamp,
        }
    }
}

/// One step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step_id: StepId,
    pub step_name: String,
    pub category: StepCategory,
    pub attempt: u32,
    pub status: StepStatus,
    pub iterations: u32,
    pub escalation_level: u32,
    pub commands: Vec<CommandLog>,
    pub user_interactions: Vec<UserInteraction>,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_history: Option<String>,
    pub compression_events: Vec<CompressionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<StepOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl StepLog {
    fn new(step: &Step, attempt: u32, status: StepStatus) -> Self {
        Self {
            step_id: step.id,
            step_name: step.name.clone(),
            category: step.category,
            attempt,
            status,
            iterations: 0,
            escalation_level: 0,
            commands: Vec::new(),
            user_interactions: Vec::new(),
            compressed: false,
            compressed_history: None,
            compression_events: Vec::new(),
            outputs: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_commands: usize,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub version: u32,
    /// `local` or `ssh`.
    pub mode: String,
    pub repo_url: String,
    pub deploy_dir: String,
    pub target: TargetInfo,
    pub repository: RepositoryInfo,
    pub config: DeployerConfig,
    pub plan: Plan,
    pub steps: Vec<StepLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_summary: Option<ExecutionSummary>,
    pub summary: RunTotals,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Owns the run log document and its file.
#[derive(Debug)]
pub struct RunRecorder {
    path: PathBuf,
    log: RunLog,
    stdout_bytes: usize,
    stderr_bytes: usize,
}

impl RunRecorder {
    /// Create the log under `dir` and write the initial document.
    pub fn create(
        dir: &Path,
        target: &TargetInfo,
        repository: &RepositoryInfo,
        config: &DeployerConfig,
        plan: &Plan,
    ) -> Result<Self> {
        let start_time = Utc::now();
        let path = dir.join(log_file_name(&repository.project_name(), start_time));
        let log = RunLog {
            version: RUN_LOG_VERSION,
            mode: target.mode.clone(),
            repo_url: repository.url.clone(),
            deploy_dir: repository.deploy_dir.clone(),
            target: target.clone(),
            repository: repository.clone(),
            config: config.clone(),
            plan: plan.clone(),
            steps: Vec::new(),
            execution_summary: None,
            summary: RunTotals::default(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
        };
        let recorder = Self {
            path,
            log,
            stdout_bytes: config.log.stdout_bytes,
            stderr_bytes: config.log.stderr_bytes,
        };
        recorder.persist()?;
        info!(path = %recorder.path.display(), "run log created");
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Add a `running` entry for a new step attempt.
    pub fn begin_step(&mut self, step: &Step, ctx: &StepContext) -> Result<()> {
        self.log
            .steps
            .push(StepLog::new(step, ctx.attempt, StepStatus::Running));
        self.persist()
    }

    /// Copy the in-flight step state into its entry and rewrite the file.
    pub fn sync_step(&mut self, ctx: &StepContext) -> Result<()> {
        let (stdout_bytes, stderr_bytes) = (self.stdout_bytes, self.stderr_bytes);
        if let Some(entry) = self.entry_mut(ctx) {
            entry.iterations = ctx.iteration;
            entry.escalation_level = ctx.escalation_level;
            entry.commands = ctx
                .commands
                .iter()
                .map(|record| CommandLog::from_record(record, stdout_bytes, stderr_bytes))
                .collect();
            entry.user_interactions = ctx.interactions.clone();
            entry.compressed = ctx.compacted_history.is_some();
            entry.compressed_history = ctx.compacted_history.clone();
            entry.compression_events = ctx.compression_events.clone();
        }
        debug!(step_id = ctx.step_id, commands = ctx.commands.len(), "run log synced");
        self.persist()
    }

    /// Record the terminal result of a step attempt.
    pub fn finish_step(&mut self, ctx: &StepContext, result: &StepResult) -> Result<()> {
        if let Some(entry) = self.entry_mut(ctx) {
            entry.status = result.status;
            entry.outputs = result.outputs.clone();
            entry.error = result.error.clone();
            entry.end_time = Some(Utc::now());
        }
        self.sync_step(ctx)
    }

    /// Add an entry for a step that never ran or was skipped by the operator.
    pub fn record_skip(&mut self, step: &Step, attempt: u32, reason: &str) -> Result<()> {
        let mut entry = StepLog::new(step, attempt, StepStatus::Skipped);
        entry.error = Some(reason.to_string());
        entry.end_time = Some(entry.start_time);
        self.log.steps.push(entry);
        self.persist()
    }

    pub fn record_summary(&mut self, summary: &ExecutionSummary) -> Result<()> {
        self.log.execution_summary = Some(summary.clone());
        self.persist()
    }

    /// Set the final status, compute totals, and write the last version.
    pub fn finalize(&mut self, status: RunStatus) -> Result<()> {
        self.log.status = status;
        self.log.end_time = Some(Utc::now());
        self.persist()?;
        info!(path = %self.path.display(), status = ?status, "run log finalized");
        Ok(())
    }

    fn entry_mut(&mut self, ctx: &StepContext) -> Option<&mut StepLog> {
        self.log
            .steps
            .iter_mut()
            .rev()
            .find(|entry| entry.step_id == ctx.step_id && entry.attempt == ctx.attempt)
    }

    fn persist(&self) -> Result<()> {
        let mut log = self.log.clone();
        log.summary = totals(&log);
        let mut buf = serde_json::to_string_pretty(&log).context("serialize run log")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
            .with_context(|| format!("write run log {}", self.path.display()))
    }
}

fn totals(log: &RunLog) -> RunTotals {
    let count = |status: StepStatus| log.steps.iter().filter(|s| s.status == status).count();
    let end = log.end_time.unwrap_or_else(Utc::now);
    RunTotals {
        total_steps: log.plan.steps.len(),
        successful_steps: count(StepStatus::Success),
        failed_steps: count(StepStatus::Failed),
        skipped_steps: count(StepStatus::Skipped),
        total_commands: log.steps.iter().map(|s| s.commands.len()).sum(),
        duration_seconds: (end - log.start_time).num_milliseconds().max(0) as f64 / 1000.0,
    }
}

/// `deploy_<project>_<YYYYmmddTHHMMSSZ>.json` with the project name sanitized.
pub fn log_file_name(project: &str, at: DateTime<Utc>) -> String {
    let project: String = project
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("deploy_{}_{}.json", project, at.format("%Y%m%dT%H%M%SZ"))
}

/// Cap `text` at `max` bytes on a char boundary, returning the bytes dropped.
fn cap_text(text: &str, max: usize) -> (String, usize) {
    if text.len() <= max {
        return (text.to_string(), 0);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), text.len() - end)
}
