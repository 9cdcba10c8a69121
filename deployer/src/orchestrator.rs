//! Plan walker: runs steps in order and applies the run-level policy.
//!
//! The orchestrator is the only writer of [`DeployContext::step_results`] and
//! the [`ExecutionSummary`]. Step failures are resolved with the operator
//! (retry, skip or abort); the run log is rewritten at every step boundary
//! and after every command.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::core::state::{DeployContext, RepositoryInfo, StepContext, TargetInfo};
use crate::core::summary::ExecutionSummary;
use crate::core::types::{Plan, RunStatus, Step, StepResult, StepStatus};
use crate::io::config::DeployerConfig;
use crate::io::interaction::{
    InteractionHandler, InteractionRequest, InteractionResponse, NotifyLevel,
};
use crate::io::oracle::DecisionOracle;
use crate::io::run_log::RunRecorder;
use crate::io::session::CommandSession;
use crate::step::{Disposition, StepExecutor};

pub const RETRY_OPTION: &str = "Retry this step";
pub const SKIP_OPTION: &str = "Skip and continue";
pub const ABORT_OPTION: &str = "Abort deployment";

/// Key in a step's `key_info` that switches the deployment strategy.
const STRATEGY_KEY: &str = "strategy";

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub context: DeployContext,
    pub summary: ExecutionSummary,
    pub log_path: PathBuf,
}

/// Whether the walk continues after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepFlow {
    Next,
    Stop(RunStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureChoice {
    Retry,
    Skip,
    Abort,
}

pub struct Orchestrator<'a> {
    executor: StepExecutor<'a>,
    handler: &'a dyn InteractionHandler,
    config: DeployerConfig,
    target: TargetInfo,
    repository: RepositoryInfo,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        oracle: &'a dyn DecisionOracle,
        session: &'a dyn CommandSession,
        handler: &'a dyn InteractionHandler,
        config: &DeployerConfig,
        target: TargetInfo,
        repository: RepositoryInfo,
    ) -> Self {
        Self {
            executor: StepExecutor::new(oracle, session, handler, config),
            handler,
            config: config.clone(),
            target,
            repository,
        }
    }

    /// Run every step of `plan` in order.
    ///
    /// Returns `Err` only when the run log cannot be written at a step boundary.
    #[instrument(skip_all, fields(steps = plan.steps.len()))]
    pub fn run(&self, plan: &Plan) -> Result<RunOutcome> {
        let mut deploy = DeployContext::new(self.target.clone(), self.repository.clone());
        let mut summary = ExecutionSummary::new(
            self.repository.project_name(),
            self.repository.deploy_dir.clone(),
            plan.strategy.clone(),
            self.config.summary.clone(),
        );
        let mut recorder = RunRecorder::create(
            &self.config.log.dir,
            &self.target,
            &self.repository,
            &self.config,
            plan,
        )?;

        info!(
            strategy = %plan.strategy,
            estimated_time = plan.estimated_time.as_deref().unwrap_or("unknown"),
            "deployment started"
        );
        for (i, step) in plan.steps.iter().enumerate() {
            info!("  {}. [{}] {}", i + 1, step.category.as_str().to_uppercase(), step.name);
        }

        let mut status = RunStatus::Success;
        for step in &plan.steps {
            match self.run_step(step, &mut deploy, &mut summary, &mut recorder)? {
                StepFlow::Next => {}
                StepFlow::Stop(stopped) => {
                    status = stopped;
                    break;
                }
            }
        }

        recorder.record_summary(&summary)?;
        recorder.finalize(status)?;
        match status {
            RunStatus::Success => {
                info!("deployment completed");
                self.handler
                    .notify("Deployment completed successfully", NotifyLevel::Success);
            }
            _ => {
                error!(status = ?status, "deployment stopped");
                self.handler.notify(
                    &format!("Deployment ended with status {status:?}"),
                    NotifyLevel::Error,
                );
            }
        }

        Ok(RunOutcome {
            status,
            context: deploy,
            summary,
            log_path: recorder.path().to_path_buf(),
        })
    }

    fn run_step(
        &self,
        step: &Step,
        deploy: &mut DeployContext,
        summary: &mut ExecutionSummary,
        recorder: &mut RunRecorder,
    ) -> Result<StepFlow> {
        if let Some(dep) = deploy.dependency_blocker(step) {
            let reason = format!("dependency {dep} not satisfied");
            warn!(step_id = step.id, reason = %reason, "skipping step");
            self.handler.notify(
                &format!("Skipping step {} ({}): {reason}", step.id, step.name),
                NotifyLevel::Warning,
            );
            deploy
                .step_results
                .insert(step.id, StepResult::skipped(step.id, reason.clone()));
            recorder.record_skip(step, 1, &reason)?;
            return Ok(StepFlow::Next);
        }

        let mut attempt = 1;
        loop {
            self.handler.notify(
                &format!("Step {}: {} (attempt {attempt})", step.id, step.name),
                NotifyLevel::Info,
            );
            let mut ctx = StepContext::new(
                step,
                attempt,
                self.config.max_iterations_per_step,
                self.config.oracle.base_temperature,
            );
            recorder.begin_step(step, &ctx)?;
            let mut sync = |partial: &StepContext| {
                if let Err(err) = recorder.sync_step(partial) {
                    warn!(err = %format!("{err:#}"), "failed to sync run log");
                }
            };
            let run = self
                .executor
                .execute(step, &mut ctx, deploy, summary, &mut sync);

            let reason = run.result.error.clone().unwrap_or_default();
            match (run.disposition, run.result.status) {
                (Disposition::Abort, _) => {
                    recorder.finish_step(&ctx, &run.result)?;
                    deploy.step_results.insert(step.id, run.result);
                    self.handler.notify(
                        &format!("Step {} aborted: {reason}", step.id),
                        NotifyLevel::Error,
                    );
                    return Ok(StepFlow::Stop(RunStatus::Aborted));
                }
                (Disposition::Skip, _) => {
                    let skipped = StepResult {
                        status: StepStatus::Skipped,
                        ..run.result
                    };
                    recorder.finish_step(&ctx, &skipped)?;
                    deploy.step_results.insert(step.id, skipped);
                    self.handler.notify(
                        &format!("Step {} skipped by operator", step.id),
                        NotifyLevel::Warning,
                    );
                    return Ok(StepFlow::Next);
                }
                (Disposition::Continue, StepStatus::Success) => {
                    recorder.finish_step(&ctx, &run.result)?;
                    if let Some(outputs) = &run.result.outputs {
                        if let Some(strategy) = outputs.key_info.get(STRATEGY_KEY)
                            && *strategy != summary.strategy
                        {
                            summary.update_strategy(strategy.clone());
                        }
                        summary.merge_step(step, outputs);
                        for (key, value) in &outputs.key_info {
                            deploy.shared_data.insert(key.clone(), value.clone());
                        }
                        self.handler.notify(
                            &format!("Step {} completed: {}", step.id, outputs.summary),
                            NotifyLevel::Success,
                        );
                    }
                    deploy.step_results.insert(step.id, run.result);
                    recorder.record_summary(summary)?;
                    return Ok(StepFlow::Next);
                }
                (Disposition::Continue, _) => {
                    recorder.finish_step(&ctx, &run.result)?;
                    deploy.step_results.insert(step.id, run.result);
                    self.handler.notify(
                        &format!("Step {} failed: {reason}", step.id),
                        NotifyLevel::Error,
                    );
                }
            }

            let can_retry = attempt <= self.config.max_step_retries;
            match self.ask_failure_policy(step, &reason, can_retry) {
                Some(FailureChoice::Retry) if can_retry => {
                    info!(step_id = step.id, attempt, "retrying step");
                    attempt += 1;
                }
                Some(FailureChoice::Skip) => {
                    info!(step_id = step.id, "operator skipped failed step");
                    deploy.step_results.insert(
                        step.id,
                        StepResult {
                            status: StepStatus::Skipped,
                            error: Some(format!("skipped by operator after failure: {reason}")),
                            ..StepResult::skipped(step.id, String::new())
                        },
                    );
                    return Ok(StepFlow::Next);
                }
                Some(FailureChoice::Retry | FailureChoice::Abort) => {
                    error!(step_id = step.id, "deployment stopped after step failure");
                    return Ok(StepFlow::Stop(RunStatus::Failed));
                }
                None => {
                    warn!(step_id = step.id, "failure prompt unanswered; aborting");
                    return Ok(StepFlow::Stop(RunStatus::Aborted));
                }
            }
        }
    }

    /// Ask how to handle a failed step; `None` when nobody answered.
    fn ask_failure_policy(
        &self,
        step: &Step,
        reason: &str,
        can_retry: bool,
    ) -> Option<FailureChoice> {
        let mut options = Vec::new();
        if can_retry {
            options.push(RETRY_OPTION.to_string());
        }
        options.push(SKIP_OPTION.to_string());
        options.push(ABORT_OPTION.to_string());
        let request = InteractionRequest::choice(
            format!(
                "Step {} ({}) failed: {reason}\nWhat would you like to do?",
                step.id, step.name
            ),
            options,
            Some(ABORT_OPTION.to_string()),
        );
        match self.handler.ask(&request) {
            InteractionResponse::Answer(answer) => Some(failure_choice(&answer)),
            InteractionResponse::Cancelled | InteractionResponse::TimedOut => None,
        }
    }
}

fn failure_choice(answer: &str) -> FailureChoice {
    let lowered = answer.trim().to_lowercase();
    if lowered.starts_with("retry") {
        FailureChoice::Retry
    } else if lowered.starts_with("skip") {
        FailureChoice::Skip
    } else {
        FailureChoice::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_choice_matches_labels() {
        assert_eq!(failure_choice(RETRY_OPTION), FailureChoice::Retry);
        assert_eq!(failure_choice(SKIP_OPTION), FailureChoice::Skip);
        assert_eq!(failure_choice(ABORT_OPTION), FailureChoice::Abort);
        assert_eq!(failure_choice("whatever"), FailureChoice::Abort);
    }
}
