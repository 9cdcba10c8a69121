//! Operator interaction: questions during a run and progress notifications.
//!
//! The step executor and orchestrator only see [`InteractionHandler`]. The
//! terminal implementation uses `dialoguer`; [`AutoInteraction`] answers every
//! question with its default for unattended runs.

use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Select};
use tracing::{error, info, warn};

const CUSTOM_INPUT_LABEL: &str = "Custom input";

/// A question put to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionRequest {
    pub question: String,
    /// Offered choices in display order; empty for free text.
    pub options: Vec<String>,
    /// Answer used when nobody can reply.
    pub default: Option<String>,
    /// Whether a free-text answer is accepted next to the options.
    pub allow_custom: bool,
}

impl InteractionRequest {
    pub fn choice(
        question: impl Into<String>,
        options: Vec<String>,
        default: Option<String>,
    ) -> Self {
        Self {
            question: question.into(),
            options,
            default,
            allow_custom: false,
        }
    }

    pub fn free_text(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            options: Vec::new(),
            default: None,
            allow_custom: true,
        }
    }

    pub fn with_custom(mut self) -> Self {
        self.allow_custom = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionResponse {
    Answer(String),
    Cancelled,
    TimedOut,
}

impl InteractionResponse {
    pub fn answer(&self) -> Option<&str> {
        match self {
            InteractionResponse::Answer(text) => Some(text),
            InteractionResponse::Cancelled | InteractionResponse::TimedOut => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

pub trait InteractionHandler {
    /// Block until the operator answers, cancels, or the handler gives up.
    fn ask(&self, request: &InteractionRequest) -> InteractionResponse;

    fn notify(&self, message: &str, level: NotifyLevel);
}

/// Interactive terminal prompts.
#[derive(Debug, Default)]
pub struct TerminalInteraction;

impl TerminalInteraction {
    fn ask_free_text(&self, prompt: &str, default: Option<&str>) -> InteractionResponse {
        let theme = ColorfulTheme::default();
        let mut input = Input::<String>::with_theme(&theme)
            .with_prompt(prompt)
            .allow_empty(true);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        match input.interact_text() {
            Ok(text) => InteractionResponse::Answer(text),
            Err(err) => {
                warn!(err = %err, "terminal input failed");
                InteractionResponse::Cancelled
            }
        }
    }
}

impl InteractionHandler for TerminalInteraction {
    fn ask(&self, request: &InteractionRequest) -> InteractionResponse {
        if request.options.is_empty() {
            return self.ask_free_text(&request.question, request.default.as_deref());
        }

        let mut items = request.options.clone();
        if request.allow_custom {
            items.push(CUSTOM_INPUT_LABEL.to_string());
        }
        let default_idx = request
            .default
            .as_ref()
            .and_then(|d| request.options.iter().position(|o| o == d))
            .unwrap_or(0);

        let theme = ColorfulTheme::default();
        let selection = Select::with_theme(&theme)
            .with_prompt(&request.question)
            .items(&items)
            .default(default_idx)
            .interact_opt();
        match selection {
            Ok(Some(idx)) if idx < request.options.len() => {
                InteractionResponse::Answer(request.options[idx].clone())
            }
            Ok(Some(_)) => self.ask_free_text("Your answer", None),
            Ok(None) => InteractionResponse::Cancelled,
            Err(err) => {
                warn!(err = %err, "terminal selection failed");
                InteractionResponse::Cancelled
            }
        }
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        let marker = match level {
            NotifyLevel::Info => "[info]",
            NotifyLevel::Success => "[ok]",
            NotifyLevel::Warning => "[warn]",
            NotifyLevel::Error => "[error]",
        };
        eprintln!("{marker} {message}");
    }
}

/// Answers every question with its default; questions without one time out.
#[derive(Debug, Default)]
pub struct AutoInteraction;

impl InteractionHandler for AutoInteraction {
    fn ask(&self, request: &InteractionRequest) -> InteractionResponse {
        match &request.default {
            Some(default) => {
                info!(question = %request.question, answer = %default, "answered with default");
                InteractionResponse::Answer(default.clone())
            }
            None => {
                warn!(question = %request.question, "no default answer in non-interactive mode");
                InteractionResponse::TimedOut
            }
        }
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Info | NotifyLevel::Success => info!("{message}"),
            NotifyLevel::Warning => warn!("{message}"),
            NotifyLevel::Error => error!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_interaction_uses_default() {
        let request = InteractionRequest::choice(
            "Step failed",
            vec!["Retry".to_string(), "Abort".to_string()],
            Some("Abort".to_string()),
        );
        assert_eq!(
            AutoInteraction.ask(&request),
            InteractionResponse::Answer("Abort".to_string())
        );
    }

    #[test]
    fn auto_interaction_without_default_times_out() {
        let request = InteractionRequest::free_text("Which port?");
        let response = AutoInteraction.ask(&request);
        assert_eq!(response, InteractionResponse::TimedOut);
        assert_eq!(response.answer(), None);
    }
}
