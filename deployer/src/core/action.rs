//! Oracle action protocol: parsing, validation and declared step outputs.
//!
//! The oracle answers every request with exactly one tagged JSON object.
//! Anything that is not one of the four known actions is a protocol error; the
//! step executor retries those a bounded number of times.

use std::sync::LazyLock;

use indexmap::IndexMap;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::types::{ResolvedIssue, StepOutputs};

const ACTION_SCHEMA: &str = include_str!("../../schemas/oracle_action.schema.json");

/// Tags accepted in the `action` field.
pub const ACTION_TAGS: [&str; 4] = ["execute", "step_done", "step_failed", "ask_user"];

static ACTION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(ACTION_SCHEMA).expect("embedded action schema should be valid JSON");
    jsonschema::validator_for(&schema).expect("embedded action schema should compile")
});

/// The closed set of actions the oracle may propose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OracleAction {
    Execute {
        command: String,
        #[serde(default)]
        reasoning: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idle_timeout_secs: Option<u64>,
    },
    StepDone {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Value>,
    },
    StepFailed {
        #[serde(default)]
        message: String,
    },
    AskUser {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
    },
}

impl OracleAction {
    pub fn tag(&self) -> &'static str {
        match self {
            OracleAction::Execute { .. } => "execute",
            OracleAction::StepDone { .. } => "step_done",
            OracleAction::StepFailed { .. } => "step_failed",
            OracleAction::AskUser { .. } => "ask_user",
        }
    }
}

/// Why an oracle response could not be turned into an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("response contains no JSON object")]
    NoJson,
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("action violates schema: {0}")]
    Schema(String),
    #[error("execute action has an empty command")]
    EmptyCommand,
}

/// Parse raw oracle text into an action.
///
/// Tolerates Markdown code fences and prose around the JSON object.
pub fn parse_action(raw: &str) -> Result<OracleAction, ProtocolError> {
    let json = extract_json(raw).ok_or(ProtocolError::NoJson)?;
    let value: Value =
        serde_json::from_str(json).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;

    if let Some(tag) = value.get("action").and_then(Value::as_str)
        && !ACTION_TAGS.contains(&tag)
    {
        return Err(ProtocolError::UnknownAction(tag.to_string()));
    }
    let messages: Vec<String> = ACTION_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ProtocolError::Schema(messages.join("; ")));
    }

    let action: OracleAction =
        serde_json::from_value(value).map_err(|err| ProtocolError::Schema(err.to_string()))?;
    if let OracleAction::Execute { command, .. } = &action
        && command.trim().is_empty()
    {
        return Err(ProtocolError::EmptyCommand);
    }
    Ok(action)
}

/// Outermost `{ ... }` span of the text.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Build [`StepOutputs`] from what the oracle declared on `step_done`.
///
/// A missing summary is synthesized from the message. Non-string `key_info`
/// values are stringified and the map is capped at `max_key_info` entries.
pub fn declared_outputs(
    outputs: Option<&Value>,
    message: &str,
    max_key_info: usize,
) -> StepOutputs {
    let summary = outputs
        .and_then(|o| o.get("summary"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            let message = message.trim();
            (!message.is_empty()).then(|| first_line(message))
        })
        .unwrap_or_else(|| "Step completed".to_string());

    let mut key_info = IndexMap::new();
    if let Some(map) = outputs.and_then(|o| o.get("key_info")).and_then(Value::as_object) {
        for (key, value) in map.iter().filter(|(_, v)| !v.is_null()).take(max_key_info) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            key_info.insert(key.clone(), text);
        }
    }

    let resolved_issues = outputs
        .and_then(|o| o.get("resolved_issues"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(resolved_issue).collect())
        .unwrap_or_default();

    StepOutputs {
        summary,
        key_info,
        resolved_issues,
    }
}

fn resolved_issue(value: &Value) -> Option<ResolvedIssue> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(ResolvedIssue {
            issue: s.trim().to_string(),
            resolution: String::new(),
        }),
        Value::Object(map) => {
            let issue = map.get("issue").and_then(Value::as_str)?.trim().to_string();
            let resolution = map
                .get("resolution")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(ResolvedIssue { issue, resolution })
        }
        _ => None,
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or(text).trim().to_string()
}
