//! Step executor: drives one step through oracle decisions until it resolves.
//!
//! Each iteration renders a prompt, asks the decision oracle for exactly one
//! action and dispatches it. Commands run through the [`CommandSession`];
//! after every command the loop detector inspects the trace and the
//! intervention ladder decides how to react. The executor never returns an
//! error: every outcome is a [`StepResult`] plus a [`Disposition`] telling the
//! orchestrator whether the operator already decided what happens next.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::action::{OracleAction, declared_outputs, parse_action};
use crate::core::budget::{CommandTimeouts, budget_for_command};
use crate::core::classifier::classify_command;
use crate::core::compaction::{CompactionSettings, maybe_compact, render_history};
use crate::core::intervention::{
    InterventionAction, InterventionLadder, LOOP_OPTIONS, LoopResolution, guidance_directive,
    resolve_reply,
};
use crate::core::loop_detector::LoopDetector;
use crate::core::state::{DeployContext, StepContext};
use crate::core::summary::ExecutionSummary;
use crate::core::types::{
    CommandRecord, InteractionSource, LoopDetection, Step, StepResult, StepStatus,
    UserInteraction,
};
use crate::io::config::{DeployerConfig, HandlerTimeoutPolicy};
use crate::io::interaction::{InteractionHandler, InteractionRequest, InteractionResponse};
use crate::io::oracle::{DecisionOracle, OracleRequest};
use crate::io::prompt::{PredecessorOutput, PromptBuilder, StepPromptInputs};
use crate::io::session::CommandSession;

/// Tunables for a step attempt, taken from [`DeployerConfig`].
#[derive(Debug, Clone)]
pub struct StepSettings {
    pub max_iterations: u32,
    /// Oracle calls per iteration when responses violate the protocol.
    pub oracle_attempts: u32,
    pub commands: CommandTimeouts,
    pub compaction: CompactionSettings,
    pub max_key_info: usize,
    pub on_handler_timeout: HandlerTimeoutPolicy,
}

impl StepSettings {
    pub fn from_config(cfg: &DeployerConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations_per_step,
            oracle_attempts: cfg.oracle.max_attempts.max(1),
            commands: cfg.commands.timeouts.clone(),
            compaction: cfg.compaction.clone(),
            max_key_info: cfg.summary.max_key_info_entries,
            on_handler_timeout: cfg.intervention.on_handler_timeout,
        }
    }
}

/// What the orchestrator must do with a resolved step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Apply the normal success/failure policy.
    Continue,
    /// The operator chose to skip the step; record it as skipped without asking again.
    Skip,
    /// The operator aborted the run (or could not be reached).
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRun {
    pub result: StepResult,
    pub disposition: Disposition,
}

pub struct StepExecutor<'a> {
    oracle: &'a dyn DecisionOracle,
    session: &'a dyn CommandSession,
    handler: &'a dyn InteractionHandler,
    detector: LoopDetector,
    ladder: InterventionLadder,
    prompts: PromptBuilder,
    settings: StepSettings,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        oracle: &'a dyn DecisionOracle,
        session: &'a dyn CommandSession,
        handler: &'a dyn InteractionHandler,
        cfg: &DeployerConfig,
    ) -> Self {
        Self {
            oracle,
            session,
            handler,
            detector: LoopDetector::new(cfg.loop_detection.clone()),
            ladder: InterventionLadder::new(cfg.intervention.temperature_ladder.clone()),
            prompts: PromptBuilder::new(cfg.oracle.prompt_budget_bytes),
            settings: StepSettings::from_config(cfg),
        }
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// Run `step` to a terminal state.
    ///
    /// `on_command` is called after every executed command with the updated
    /// context so callers can persist partial progress.
    #[instrument(skip_all, fields(step_id = step.id, attempt = ctx.attempt))]
    pub fn execute(
        &self,
        step: &Step,
        ctx: &mut StepContext,
        deploy: &DeployContext,
        summary: &ExecutionSummary,
        on_command: &mut dyn FnMut(&StepContext),
    ) -> StepRun {
        ctx.status = StepStatus::Running;
        info!(name = %step.name, max_iterations = ctx.max_iterations, "step started");

        loop {
            if ctx.budget_exhausted() {
                warn!(iterations = ctx.iteration, "iteration budget exhausted");
                let reason = format!(
                    "budget exhausted: {} iterations without completing the step",
                    ctx.max_iterations
                );
                let result = failed(ctx, reason);
                return finish(ctx, result, Disposition::Continue);
            }
            ctx.iteration += 1;
            maybe_compact(ctx, &self.settings.compaction);

            let request = match self.build_request(step, ctx, deploy, summary) {
                Ok(request) => request,
                Err(err) => {
                    let reason = format!("could not render prompt: {err:#}");
                    let result = failed(ctx, reason);
                    return finish(ctx, result, Disposition::Continue);
                }
            };
            let action = match self.next_action(&request) {
                Ok(action) => action,
                Err(reason) => {
                    let reason = format!("oracle protocol failure: {reason}");
                    let result = failed(ctx, reason);
                    return finish(ctx, result, Disposition::Continue);
                }
            };
            // Directives and replies are shown to the oracle once.
            ctx.reflection = None;
            ctx.pending_reply = None;
            debug!(iteration = ctx.iteration, action = action.tag(), "oracle chose action");

            match action {
                OracleAction::Execute {
                    command,
                    reasoning,
                    timeout_secs,
                    idle_timeout_secs,
                } => {
                    let budget = budget_for_command(
                        &command,
                        &self.settings.commands,
                        timeout_secs,
                        idle_timeout_secs,
                    );
                    let kind = classify_command(&command);
                    let outcome = self.session.run(&command, budget);
                    ctx.commands
                        .push(CommandRecord::new(command, reasoning, kind, outcome, Utc::now()));
                    on_command(ctx);
                    if let Some(run) = self.after_command(ctx) {
                        return run;
                    }
                }
                OracleAction::StepDone { message, outputs } => {
                    let outputs =
                        declared_outputs(outputs.as_ref(), &message, self.settings.max_key_info);
                    info!(summary = %outputs.summary, iterations = ctx.iteration, "step done");
                    let result = StepResult::success(
                        step.id,
                        outputs,
                        ctx.commands.len(),
                        ctx.iteration,
                    );
                    return finish(ctx, result, Disposition::Continue);
                }
                OracleAction::StepFailed { message } => {
                    let reason = if message.trim().is_empty() {
                        "oracle declared the step failed".to_string()
                    } else {
                        message.trim().to_string()
                    };
                    warn!(reason = %reason, "oracle declared step failed");
                    let result = failed(ctx, reason);
                    return finish(ctx, result, Disposition::Continue);
                }
                OracleAction::AskUser { question, options } => {
                    if let Some(run) = self.ask_user(ctx, question, options.unwrap_or_default()) {
                        return run;
                    }
                }
            }
        }
    }

    fn build_request(
        &self,
        step: &Step,
        ctx: &StepContext,
        deploy: &DeployContext,
        summary: &ExecutionSummary,
    ) -> anyhow::Result<OracleRequest> {
        let predecessors = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                let outputs = deploy.step_results.get(dep)?.outputs.clone()?;
                Some(PredecessorOutput {
                    step_id: *dep,
                    outputs,
                })
            })
            .collect();
        let summary_text = summary.prompt_context();
        let history = render_history(ctx, self.settings.compaction.output_preview_chars);
        let inputs = StepPromptInputs {
            target: self.session.describe(),
            step: step.clone(),
            iteration: ctx.iteration,
            max_iterations: ctx.max_iterations,
            directive: ctx.reflection.clone(),
            summary: summary_text.clone(),
            predecessors,
            interactions: ctx.interactions.clone(),
            pending_reply: ctx.pending_reply.clone(),
            history: history.clone(),
        };
        let prompt = self.prompts.build_step(&inputs)?;
        Ok(OracleRequest {
            step_id: step.id,
            step_name: step.name.clone(),
            goal: step.goal.clone(),
            success_criteria: step.criteria(),
            summary: summary_text,
            history,
            directive: ctx.reflection.clone(),
            temperature: ctx.temperature,
            iteration: ctx.iteration,
            max_iterations: ctx.max_iterations,
            prompt,
        })
    }

    /// Call the oracle until it returns a valid action or attempts run out.
    fn next_action(&self, request: &OracleRequest) -> Result<OracleAction, String> {
        let mut last_error = String::from("no oracle attempts made");
        for attempt in 1..=self.settings.oracle_attempts {
            let raw = match self.oracle.decide(request) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(attempt, err = %format!("{err:#}"), "oracle call failed");
                    last_error = format!("{err:#}");
                    continue;
                }
            };
            match parse_action(&raw) {
                Ok(action) => return Ok(action),
                Err(err) => {
                    warn!(attempt, err = %err, "invalid oracle response");
                    last_error = err.to_string();
                }
            }
        }
        Err(format!(
            "{} after {} attempts",
            last_error, self.settings.oracle_attempts
        ))
    }

    /// Loop detection and intervention after a command was recorded.
    fn after_command(&self, ctx: &mut StepContext) -> Option<StepRun> {
        if ctx.detection_pause > 0 {
            ctx.detection_pause -= 1;
            debug!(remaining = ctx.detection_pause, "loop detection paused");
            return None;
        }
        let detection = self.detector.check(ctx);
        if !detection.is_loop() {
            return None;
        }
        self.intervene(ctx, &detection)
    }

    fn intervene(&self, ctx: &mut StepContext, detection: &LoopDetection) -> Option<StepRun> {
        let intervention = self.ladder.decide(detection, ctx.escalation_level);
        ctx.escalation_level = intervention.new_level;
        ctx.temperature = intervention.action.temperature();
        info!(
            loop_kind = %detection.kind,
            level = intervention.new_level,
            temperature = ctx.temperature,
            "loop intervention"
        );
        match intervention.action {
            InterventionAction::BoostExploration { .. } => None,
            InterventionAction::InjectReflection { directive, .. } => {
                ctx.reflection = Some(directive);
                None
            }
            InterventionAction::AskHuman {
                question, options, ..
            } => self.ask_about_loop(ctx, question, options),
        }
    }

    fn ask_about_loop(
        &self,
        ctx: &mut StepContext,
        question: String,
        options: Vec<String>,
    ) -> Option<StepRun> {
        let request =
            InteractionRequest::choice(question, options, Some(LOOP_OPTIONS[0].to_string()))
                .with_custom();
        let response = self.handler.ask(&request);
        record_interaction(ctx, InteractionSource::LoopIntervention, &request, &response);
        let Some(reply) = response.answer() else {
            return self.unanswered_loop_question(ctx);
        };

        let mut resolution = resolve_reply(reply);
        if resolution == LoopResolution::NeedsGuidance {
            let follow_up = InteractionRequest::free_text("Guidance for the next attempt");
            let response = self.handler.ask(&follow_up);
            record_interaction(ctx, InteractionSource::LoopIntervention, &follow_up, &response);
            resolution = match response.answer().map(str::trim) {
                Some("") => LoopResolution::Continue,
                Some(text) => LoopResolution::Guidance(text.to_string()),
                None => return self.unanswered_loop_question(ctx),
            };
        }

        let pause = self.detector.settings().pause_after_human;
        match resolution {
            LoopResolution::Continue | LoopResolution::NeedsGuidance => {
                info!("operator chose to continue after loop");
                ctx.detection_pause = pause;
                None
            }
            LoopResolution::Guidance(text) => {
                info!("operator provided loop guidance");
                ctx.reflection = Some(guidance_directive(&text));
                ctx.detection_pause = pause;
                None
            }
            LoopResolution::SkipStep => {
                info!("operator skipped step after loop");
                let result = failed(ctx, "skipped by operator after loop detection");
                Some(finish(ctx, result, Disposition::Skip))
            }
            LoopResolution::AbortRun => {
                warn!("operator aborted deployment after loop");
                let result = failed(ctx, "deployment aborted by operator after loop detection");
                Some(finish(ctx, result, Disposition::Abort))
            }
        }
    }

    fn unanswered_loop_question(&self, ctx: &mut StepContext) -> Option<StepRun> {
        match self.settings.on_handler_timeout {
            HandlerTimeoutPolicy::Abort => {
                warn!("no answer to loop intervention; aborting");
                let result = failed(ctx, "no operator response to loop intervention");
                Some(finish(ctx, result, Disposition::Abort))
            }
            HandlerTimeoutPolicy::Continue => {
                warn!("no answer to loop intervention; continuing autonomously");
                ctx.detection_pause = self.detector.settings().pause_after_human;
                None
            }
        }
    }

    fn ask_user(
        &self,
        ctx: &mut StepContext,
        question: String,
        options: Vec<String>,
    ) -> Option<StepRun> {
        let default = options.first().cloned();
        let request = InteractionRequest::choice(question, options, default).with_custom();
        let response = self.handler.ask(&request);
        record_interaction(ctx, InteractionSource::Oracle, &request, &response);
        match response {
            InteractionResponse::Answer(reply) => {
                ctx.pending_reply = Some(reply);
                None
            }
            InteractionResponse::Cancelled | InteractionResponse::TimedOut => {
                warn!(question = %request.question, "question left unanswered; aborting");
                let result = failed(
                    ctx,
                    format!("operator did not answer: {}", request.question),
                );
                Some(finish(ctx, result, Disposition::Abort))
            }
        }
    }
}

fn record_interaction(
    ctx: &mut StepContext,
    source: InteractionSource,
    request: &InteractionRequest,
    response: &InteractionResponse,
) {
    ctx.interactions.push(UserInteraction {
        source,
        question: request.question.clone(),
        options: request.options.clone(),
        reply: response.answer().map(str::to_string),
        iteration: ctx.iteration,
        timestamp: Utc::now(),
    });
}

fn failed(ctx: &StepContext, reason: impl Into<String>) -> StepResult {
    StepResult::failed(ctx.step_id, reason, ctx.commands.len(), ctx.iteration)
}

fn finish(ctx: &mut StepContext, result: StepResult, disposition: Disposition) -> StepRun {
    debug_assert!(result.status.is_terminal(), "step finished as {}", result.status);
    ctx.status = result.status;
    StepRun {
        result,
        disposition,
    }
}
