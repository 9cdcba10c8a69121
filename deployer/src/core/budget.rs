//! Per-command timeout budgets.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SLEEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bsleep\s+|\btimeout\s+/t\s+|start-sleep\s+(?:-seconds\s+)?)(\d+)")
        .expect("sleep regex")
});
static FOLLOW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(?:-f|--follow)(?:\s|$)").expect("follow regex"));

/// Timeout policy for commands run by the step executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTimeouts {
    pub total_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub long_running_total_secs: u64,
    pub long_running_idle_secs: u64,
    /// Idle window for follow-mode commands (`tail -f`, `logs --follow`).
    pub follow_idle_secs: u64,
    /// Added on top of an explicit `sleep N`.
    pub sleep_margin_secs: u64,
    /// Substrings marking commands known to run for a long time.
    pub long_running_patterns: Vec<String>,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            total_timeout_secs: 600,
            idle_timeout_secs: 60,
            long_running_total_secs: 1800,
            long_running_idle_secs: 180,
            follow_idle_secs: 300,
            sleep_margin_secs: 120,
            long_running_patterns: [
                "npm install",
                "npm ci",
                "pnpm install",
                "yarn install",
                "pip install",
                "pip3 install",
                "docker build",
                "docker compose build",
                "docker compose up",
                "docker-compose build",
                "docker-compose up",
                "cargo build",
                "mvn install",
                "mvn package",
                "gradle build",
                "apt-get install",
                "apt install",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Wall-clock limits for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBudget {
    pub total: Duration,
    pub idle: Duration,
}

impl CommandBudget {
    pub fn from_secs(total: u64, idle: u64) -> Self {
        Self {
            total: Duration::from_secs(total),
            idle: Duration::from_secs(idle),
        }
    }
}

/// Derive the timeout budget for a command.
///
/// Explicit overrides win over everything derived from the command text.
pub fn budget_for_command(
    command: &str,
    timeouts: &CommandTimeouts,
    total_override: Option<u64>,
    idle_override: Option<u64>,
) -> CommandBudget {
    let lowered = command.to_lowercase();
    let mut total = timeouts.total_timeout_secs;
    let mut idle = timeouts.idle_timeout_secs;

    if timeouts
        .long_running_patterns
        .iter()
        .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    {
        total = total.max(timeouts.long_running_total_secs);
        idle = idle.max(timeouts.long_running_idle_secs);
    }
    if FOLLOW_RE.is_match(&lowered) {
        idle = idle.max(timeouts.follow_idle_secs);
    }
    let slept: u64 = SLEEP_RE
        .captures_iter(&lowered)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .fold(0, u64::saturating_add);
    if slept > 0 {
        total = total.max(slept.saturating_add(timeouts.sleep_margin_secs));
        idle = idle.max(slept.saturating_add(timeouts.sleep_margin_secs.min(idle)));
    }

    CommandBudget::from_secs(
        total_override.unwrap_or(total),
        idle_override.unwrap_or(idle),
    )
}
