//! Stateless classification of a step's recent command trace.
//!
//! Two patterns are recognized, checked in this order:
//!
//! - **direct repeat**: the last N commands are near-identical and so are their
//!   normalized outputs.
//! - **error loop**: the last M commands all failed with near-identical error
//!   signatures, even though the commands differ.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::similarity::{command_similarity, error_signature, output_similarity, ratio};
use crate::core::state::StepContext;
use crate::core::types::{CommandRecord, LoopDetection, LoopKind};

/// Detection never runs on shorter traces.
pub const MIN_TRACE_LEN: usize = 3;

/// Thresholds and window sizes for loop detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionSettings {
    pub enabled: bool,
    /// Commands inspected by the direct-repeat check.
    pub direct_repeat_window: usize,
    /// Commands inspected by the error-loop check.
    pub error_loop_window: usize,
    pub command_similarity: f64,
    /// Threshold for normalized outputs and for error signatures.
    pub output_similarity: f64,
    /// Commands to run without detection after an operator chose to continue.
    pub pause_after_human: u32,
}

impl Default for LoopDetectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            direct_repeat_window: 3,
            error_loop_window: 4,
            command_similarity: 0.85,
            output_similarity: 0.80,
            pause_after_human: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    settings: LoopDetectionSettings,
}

impl LoopDetector {
    pub fn new(settings: LoopDetectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LoopDetectionSettings {
        &self.settings
    }

    /// Classify the command trace of a running step.
    pub fn check(&self, ctx: &StepContext) -> LoopDetection {
        self.check_trace(&ctx.commands)
    }

    /// Classify a command trace; only the first matching pattern is reported.
    pub fn check_trace(&self, commands: &[CommandRecord]) -> LoopDetection {
        if !self.settings.enabled || commands.len() < MIN_TRACE_LEN {
            return LoopDetection::none();
        }
        let repeat = self.direct_repeat(commands);
        if repeat.is_loop() {
            return repeat;
        }
        self.error_loop(commands)
    }

    fn direct_repeat(&self, commands: &[CommandRecord]) -> LoopDetection {
        let window = self.settings.direct_repeat_window.max(2);
        if commands.len() < window {
            return LoopDetection::none();
        }
        let start = commands.len() - window;
        let recent = &commands[start..];

        let command_sim = min_pairwise(recent, |a, b| command_similarity(&a.command, &b.command));
        if command_sim < self.settings.command_similarity {
            return LoopDetection::none();
        }
        let outputs: Vec<String> = recent.iter().map(CommandRecord::combined_output).collect();
        let output_sim = min_pairwise(&outputs, |a, b| output_similarity(a, b));
        if output_sim < self.settings.output_similarity {
            return LoopDetection::none();
        }

        let evidence = vec![
            format!(
                "Command repeated {window} times: {}",
                preview(&recent[0].command, 60)
            ),
            format!("Command similarity: {command_sim:.2}"),
            format!("Output similarity: {output_sim:.2}"),
        ];
        warn!(
            loop_kind = "direct_repeat",
            command = %preview(&recent[0].command, 60),
            command_sim,
            output_sim,
            "loop detected"
        );
        LoopDetection {
            kind: LoopKind::DirectRepeat,
            confidence: command_sim.min(output_sim + 0.1),
            evidence,
            indices: (start..commands.len()).collect(),
        }
    }

    fn error_loop(&self, commands: &[CommandRecord]) -> LoopDetection {
        let window = self.settings.error_loop_window.max(2);
        if commands.len() < window {
            return LoopDetection::none();
        }
        let start = commands.len() - window;
        let recent = &commands[start..];
        if recent.iter().any(CommandRecord::succeeded) {
            return LoopDetection::none();
        }

        let signatures: Vec<String> = recent.iter().map(failure_signature).collect();
        let signature_sim = min_pairwise(&signatures, |a, b| ratio(a, b));
        if signature_sim < self.settings.output_similarity {
            return LoopDetection::none();
        }

        let evidence = vec![
            format!("Continuous failures: {window}/{window} commands"),
            format!("Repeated error: {}", preview(&signatures[0], 80)),
            format!("Error similarity: {signature_sim:.2}"),
        ];
        warn!(
            loop_kind = "error_loop",
            signature = %preview(&signatures[0], 80),
            signature_sim,
            "loop detected"
        );
        LoopDetection {
            kind: LoopKind::ErrorLoop,
            confidence: signature_sim,
            evidence,
            indices: (start..commands.len()).collect(),
        }
    }
}

fn failure_signature(record: &CommandRecord) -> String {
    if record.stderr.trim().is_empty() {
        error_signature(&record.stdout)
    } else {
        error_signature(&record.stderr)
    }
}

/// Smallest similarity over every pair in `items`.
fn min_pairwise<T>(items: &[T], similarity: impl Fn(&T, &T) -> f64) -> f64 {
    let mut lowest = 1.0_f64;
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            lowest = lowest.min(similarity(a, b));
        }
    }
    lowest
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
