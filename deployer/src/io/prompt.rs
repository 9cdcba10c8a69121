//! Prompt builder for decision oracle requests.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Step, StepOutputs, UserInteraction};

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");

/// Interactions shown to the oracle.
const RECENT_INTERACTIONS: usize = 3;
const TRUNCATION_MARKER: &str = "[earlier history truncated]\n";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Step fields rendered in the prompt.
#[derive(Debug, Clone, Serialize)]
struct StepView {
    id: u32,
    name: String,
    category: &'static str,
    goal: String,
    success_criteria: String,
}

#[derive(Debug, Clone, Serialize)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Debug, Clone, Serialize)]
struct PredecessorView {
    id: u32,
    summary: String,
    key_info: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize)]
struct InteractionView {
    question: String,
    reply: String,
}

/// Outputs of a direct dependency of the current step.
#[derive(Debug, Clone)]
pub struct PredecessorOutput {
    pub step_id: u32,
    pub outputs: StepOutputs,
}

/// All inputs needed to render a step prompt.
#[derive(Debug, Clone)]
pub struct StepPromptInputs {
    /// Target description (`local:/srv/app`, `ssh:deploy@host:22`).
    pub target: String,
    pub step: Step,
    /// 1-based number of the iteration this prompt is for.
    pub iteration: u32,
    pub max_iterations: u32,
    pub directive: Option<String>,
    pub summary: String,
    pub predecessors: Vec<PredecessorOutput>,
    pub interactions: Vec<UserInteraction>,
    pub pending_reply: Option<String>,
    pub history: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("step", STEP_TEMPLATE)
            .expect("step template should be valid");
        Self { env }
    }

    fn render_step(&self, input: &StepPromptInputs) -> Result<String> {
        let step = StepView {
            id: input.step.id,
            name: input.step.name.clone(),
            category: input.step.category.as_str(),
            goal: input.step.goal.trim().to_string(),
            success_criteria: input.step.criteria(),
        };
        let predecessors: Vec<PredecessorView> = input
            .predecessors
            .iter()
            .map(|p| PredecessorView {
                id: p.step_id,
                summary: p.outputs.summary.clone(),
                key_info: p
                    .outputs
                    .key_info
                    .iter()
                    .map(|(key, value)| KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            })
            .collect();
        let skip = input.interactions.len().saturating_sub(RECENT_INTERACTIONS);
        let interactions: Vec<InteractionView> = input.interactions[skip..]
            .iter()
            .map(|i| InteractionView {
                question: i.question.clone(),
                reply: i.reply.clone().unwrap_or_else(|| "(no reply)".to_string()),
            })
            .collect();
        let history = if input.history.trim().is_empty() {
            "(no commands executed yet)".to_string()
        } else {
            input.history.trim().to_string()
        };

        let template = self.env.get_template("step")?;
        let rendered = template.render(context! {
            target => input.target,
            directive => input.directive.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            summary => (!input.summary.trim().is_empty()).then(|| input.summary.trim()),
            predecessors => predecessors,
            step => step,
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            hints => input.step.hint_commands,
            interactions => interactions,
            pending_reply => input
                .pending_reply
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            history => history,
            budget_warning => budget_warning(input.iteration, input.max_iterations),
        })?;
        Ok(rendered)
    }
}

/// Warning shown once more than 70% of the iteration budget is used.
fn budget_warning(iteration: u32, max_iterations: u32) -> Option<String> {
    if max_iterations == 0 || u64::from(iteration) * 10 <= u64::from(max_iterations) * 7 {
        return None;
    }
    let remaining = max_iterations.saturating_sub(iteration);
    Some(format!(
        "Iteration {iteration} of {max_iterations}; {remaining} left after this one. \
         Converge now: verify the success criteria and declare step_done, or declare \
         step_failed if the step is blocked."
    ))
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "history").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Full section content including header.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: hints -> predecessors -> interactions -> summary. If still over
/// budget, the oldest part of the command history is cut.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    // Content plus the blank-line separators added by `render_sections`.
    let total_len = |secs: &[ParsedSection]| -> usize {
        secs.iter().map(|s| s.content.len()).sum::<usize>() + 2 * secs.len().saturating_sub(1)
    };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["hints", "predecessors", "interactions", "summary"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    if let Some(history) = sections.iter_mut().find(|s| s.key == "history") {
        let before_len = history.content.len();
        let excess = total - budget;
        truncate_history_head(&mut history.content, excess);
        debug!(
            before_len,
            after_len = history.content.len(),
            "truncated history for budget"
        );
    }
}

/// Remove at least `excess` bytes from the start of the history body, keeping
/// the header and the most recent lines.
fn truncate_history_head(content: &mut String, excess: usize) {
    let Some(open) = content.find("<history>\n") else {
        return;
    };
    let body_start = open + "<history>\n".len();
    let close = content.rfind("\n</history>").unwrap_or(content.len());
    if close <= body_start {
        return;
    }
    let mut cut = (body_start + excess + TRUNCATION_MARKER.len()).min(close);
    while !content.is_char_boundary(cut) {
        cut += 1;
    }
    // Resume at a line start when one is available.
    if let Some(newline) = content[cut..close].find('\n') {
        cut += newline + 1;
    }
    content.replace_range(body_start..cut, TRUNCATION_MARKER);
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds oracle prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    /// Create a builder with the given byte budget.
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Render the prompt for one step iteration.
    pub fn build_step(&self, input: &StepPromptInputs) -> Result<String> {
        let rendered = PromptEngine::new()
            .render_step(input)
            .context("render step prompt")?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InteractionSource;
    use crate::test_support::step;
    use chrono::Utc;

    fn inputs() -> StepPromptInputs {
        let mut step = step(2);
        step.hint_commands = vec!["node --version".to_string()];
        let mut outputs = StepOutputs {
            summary: "cloned repo".to_string(),
            ..StepOutputs::default()
        };
        outputs
            .key_info
            .insert("deploy_path".to_string(), "/srv/app".to_string());
        StepPromptInputs {
            target: "local:/srv/app".to_string(),
            step,
            iteration: 1,
            max_iterations: 10,
            directive: None,
            summary: "- Project: app".to_string(),
            predecessors: vec![PredecessorOutput {
                step_id: 1,
                outputs,
            }],
            interactions: vec![UserInteraction {
                source: InteractionSource::Oracle,
                question: "Which port?".to_string(),
                options: Vec::new(),
                reply: Some("8080".to_string()),
                iteration: 1,
                timestamp: Utc::now(),
            }],
            pending_reply: None,
            history: String::new(),
        }
    }

    /// Sections appear in a fixed order so prompts stay comparable across calls.
    #[test]
    fn prompt_ordering_is_stable() {
        let mut input = inputs();
        input.directive = Some("Reflect first".to_string());
        input.pending_reply = Some("use 8080".to_string());
        let content = PromptBuilder::new(60_000).build_step(&input).expect("build");

        let order = [
            "### Required Before Your Next Action",
            "### Response Contract",
            "### Deployment State",
            "### Outputs From Dependencies",
            "### Current Step",
            "### Suggested Commands",
            "### Recent User Interactions",
            "### User Reply",
            "### Command History",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|h| content.find(h).unwrap_or_else(|| panic!("missing {h}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{content}");
        assert!(content.contains("deploy_path: /srv/app"));
        assert!(content.contains("(no commands executed yet)"));
        assert!(!content.contains("<!-- section"));
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let mut input = inputs();
        input.predecessors.clear();
        input.interactions.clear();
        input.step.hint_commands.clear();
        let content = PromptBuilder::new(60_000).build_step(&input).expect("build");
        assert!(!content.contains("### Outputs From Dependencies"));
        assert!(!content.contains("### Recent User Interactions"));
        assert!(!content.contains("### Suggested Commands"));
        assert!(!content.contains("### Iteration Budget"));
    }

    #[test]
    fn budget_warning_appears_past_seventy_percent() {
        let mut input = inputs();
        input.iteration = 8;
        let content = PromptBuilder::new(60_000).build_step(&input).expect("build");
        assert!(content.contains("### Iteration Budget"));
        assert!(content.contains("Iteration 8 of 10"));
        input.iteration = 7;
        let content = PromptBuilder::new(60_000).build_step(&input).expect("build");
        assert!(!content.contains("### Iteration Budget"));
    }

    /// With a tight budget, optional context goes first and the history keeps its tail.
    #[test]
    fn budget_drops_optional_sections_then_trims_history_head() {
        let mut input = inputs();
        input.summary = "summary line\n".repeat(200);
        input.history = (0..400)
            .map(|i| format!("#{i} $ echo {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let content = PromptBuilder::new(3_000).build_step(&input).expect("build");

        assert!(!content.contains("### Suggested Commands"));
        assert!(!content.contains("### Outputs From Dependencies"));
        assert!(!content.contains("### Deployment State"));
        assert!(content.contains("### Response Contract"));
        assert!(content.contains("### Current Step"));
        assert!(content.contains("[earlier history truncated]"));
        assert!(content.contains("#399 $ echo 399"));
        assert!(!content.contains("#0 $ echo 0\n"));
        assert!(content.len() <= 3_000, "len {}", content.len());
    }
}
