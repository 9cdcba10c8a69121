//! Escalation ladder applied when a loop is detected within a step.
//!
//! The ladder is a pure decision function: it maps the current escalation
//! level to the next remedial action and never performs I/O. The step executor
//! carries out whatever it returns.

use serde::{Deserialize, Serialize};

use crate::core::types::{LoopDetection, LoopKind};

/// Options offered to the operator at the ask-human tier, in display order.
pub const LOOP_OPTIONS: [&str; 4] = [
    "Continue",
    "Skip this step",
    "Abort deployment",
    "Provide guidance",
];

/// Ladder tiers in strictly increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    BoostExploration,
    Reflect,
    AskHuman,
}

impl EscalationTier {
    /// Tier reached at a (1-based) escalation level; saturates at `AskHuman`.
    pub fn for_level(level: u32) -> Self {
        match level {
            0 | 1 => EscalationTier::BoostExploration,
            2 => EscalationTier::Reflect,
            _ => EscalationTier::AskHuman,
        }
    }

    pub fn level(self) -> u32 {
        match self {
            EscalationTier::BoostExploration => 1,
            EscalationTier::Reflect => 2,
            EscalationTier::AskHuman => 3,
        }
    }
}

/// What the step executor must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum InterventionAction {
    BoostExploration {
        temperature: f64,
    },
    InjectReflection {
        temperature: f64,
        directive: String,
    },
    AskHuman {
        temperature: f64,
        question: String,
        options: Vec<String>,
    },
}

impl InterventionAction {
    pub fn temperature(&self) -> f64 {
        match self {
            InterventionAction::BoostExploration { temperature }
            | InterventionAction::InjectReflection { temperature, .. }
            | InterventionAction::AskHuman { temperature, .. } => *temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Intervention {
    pub action: InterventionAction,
    pub new_level: u32,
}

/// How an operator's reply at the ask-human tier maps back into the step loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopResolution {
    Continue,
    SkipStep,
    AbortRun,
    Guidance(String),
    /// Operator picked "Provide guidance"; the text still has to be collected.
    NeedsGuidance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterventionLadder {
    temperatures: Vec<f64>,
}

impl InterventionLadder {
    pub fn new(temperatures: Vec<f64>) -> Self {
        Self { temperatures }
    }

    /// Decide the next intervention for a detected loop.
    ///
    /// `level` is the step's current escalation level (0 on a fresh step).
    /// The returned level is strictly greater until the ask-human tier, where
    /// it saturates.
    pub fn decide(&self, detection: &LoopDetection, level: u32) -> Intervention {
        let new_level = (level + 1).min(EscalationTier::AskHuman.level());
        let tier = EscalationTier::for_level(new_level);
        let temperature = self.temperature_for(tier);
        let action = match tier {
            EscalationTier::BoostExploration => {
                InterventionAction::BoostExploration { temperature }
            }
            EscalationTier::Reflect => InterventionAction::InjectReflection {
                temperature,
                directive: reflection_directive(detection),
            },
            EscalationTier::AskHuman => InterventionAction::AskHuman {
                temperature,
                question: loop_question(detection),
                options: LOOP_OPTIONS.iter().map(|s| s.to_string()).collect(),
            },
        };
        Intervention { action, new_level }
    }

    fn temperature_for(&self, tier: EscalationTier) -> f64 {
        let idx = (tier.level() - 1) as usize;
        match self.temperatures.get(idx).or(self.temperatures.last()) {
            Some(t) => *t,
            None => 0.0,
        }
    }
}

impl Default for InterventionLadder {
    fn default() -> Self {
        Self::new(vec![0.3, 0.5, 0.7])
    }
}

/// Map an operator reply to a loop resolution.
///
/// Accepts an option label, its 1-based number, or a leading keyword. Any
/// other non-empty text is taken as guidance; an empty reply continues.
pub fn resolve_reply(reply: &str) -> LoopResolution {
    let trimmed = reply.trim();
    let lowered = trimmed.to_lowercase();
    if lowered.is_empty() || lowered == "1" || lowered.starts_with("continue") {
        return LoopResolution::Continue;
    }
    if lowered == "2" || lowered.starts_with("skip") {
        return LoopResolution::SkipStep;
    }
    if lowered == "3" || lowered.starts_with("abort") {
        return LoopResolution::AbortRun;
    }
    if lowered == "4" || lowered == "provide guidance" || lowered == "guidance" {
        return LoopResolution::NeedsGuidance;
    }
    LoopResolution::Guidance(trimmed.to_string())
}

/// Mandatory reflection block injected at the second tier.
pub fn reflection_directive(detection: &LoopDetection) -> String {
    let behaviour = match detection.kind {
        LoopKind::DirectRepeat => "repeating the same command without progress",
        LoopKind::ErrorLoop => "trying different commands but hitting the same error",
        LoopKind::None => "executing in a loop",
    };
    let evidence = detection
        .evidence
        .iter()
        .map(|line| format!("- {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "LOOP DETECTED: REFLECTION REQUIRED\n\n\
         Recent attempts show you are {behaviour}:\n{evidence}\n\
         Confidence: {confidence:.0}%\n\n\
         Before your next action you MUST:\n\
         1. State why the previous attempts failed and which assumption was wrong.\n\
         2. Propose a materially different strategy. Adding flags such as --force or \
         re-running with sudo does not count.\n\
         3. Justify why the new approach will work, or declare step_failed if you \
         cannot find one.\n\n\
         Repeating the same pattern is not acceptable.",
        confidence = detection.confidence * 100.0,
    )
}

/// Wrap operator guidance so the oracle treats it like a reflection directive.
pub fn guidance_directive(guidance: &str) -> String {
    format!(
        "OPERATOR GUIDANCE\n\nThe operator reviewed the loop and instructs:\n{}\n\n\
         Follow this guidance for your next action.",
        guidance.trim()
    )
}

fn loop_question(detection: &LoopDetection) -> String {
    let evidence = detection
        .evidence
        .iter()
        .map(|line| format!("  - {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "The step appears stuck ({kind}).\n{evidence}\nHow should the deployment proceed?",
        kind = detection.kind
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection() -> LoopDetection {
        LoopDetection {
            kind: LoopKind::DirectRepeat,
            confidence: 0.95,
            evidence: vec!["Command repeated 3 times: npm start".to_string()],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn ladder_escalates_then_saturates() {
        let ladder = InterventionLadder::default();
        let mut level = 0;
        let mut seen = Vec::new();
        for _ in 0..5 {
            let intervention = ladder.decide(&detection(), level);
            assert!(intervention.new_level >= level);
            if level < EscalationTier::AskHuman.level() {
                assert!(intervention.new_level > level, "must strictly increase");
            }
            level = intervention.new_level;
            seen.push(level);
        }
        assert_eq!(seen, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn tiers_map_to_expected_actions() {
        let ladder = InterventionLadder::default();
        let first = ladder.decide(&detection(), 0);
        assert_eq!(
            first.action,
            InterventionAction::BoostExploration { temperature: 0.3 }
        );

        let second = ladder.decide(&detection(), 1);
        match &second.action {
            InterventionAction::InjectReflection {
                temperature,
                directive,
            } => {
                assert!((temperature - 0.5).abs() < f64::EPSILON);
                assert!(directive.contains("npm start"));
                assert!(directive.contains("step_failed"));
            }
            other => panic!("unexpected action {other:?}"),
        }

        let third = ladder.decide(&detection(), 2);
        match &third.action {
            InterventionAction::AskHuman { options, .. } => assert_eq!(options.len(), 4),
            other => panic!("unexpected action {other:?}"),
        }
        assert!((third.action.temperature() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn short_ladder_reuses_last_temperature() {
        let ladder = InterventionLadder::new(vec![0.4]);
        let third = ladder.decide(&detection(), 2);
        assert!((third.action.temperature() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn replies_resolve_by_label_number_or_free_text() {
        assert_eq!(resolve_reply("Continue"), LoopResolution::Continue);
        assert_eq!(resolve_reply(""), LoopResolution::Continue);
        assert_eq!(resolve_reply("Skip this step"), LoopResolution::SkipStep);
        assert_eq!(resolve_reply("3"), LoopResolution::AbortRun);
        assert_eq!(resolve_reply("Provide guidance"), LoopResolution::NeedsGuidance);
        assert_eq!(
            resolve_reply("  use port 8081 instead "),
            LoopResolution::Guidance("use port 8081 instead".to_string())
        );
    }
}
