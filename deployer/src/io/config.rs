//! Deployer configuration, usually `deployer.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::CommandTimeouts;
use crate::core::compaction::CompactionSettings;
use crate::core::loop_detector::LoopDetectionSettings;
use crate::core::summary::SummaryLimits;

/// Deployer configuration (TOML).
///
/// Every field has a default, so an empty or missing file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployerConfig {
    /// Oracle calls allowed per step attempt before it fails.
    pub max_iterations_per_step: u32,

    /// Retries the failure prompt offers per step.
    pub max_step_retries: u32,

    pub oracle: OracleConfig,
    pub commands: CommandsConfig,
    pub loop_detection: LoopDetectionSettings,
    pub intervention: InterventionConfig,
    pub summary: SummaryLimits,
    pub compaction: CompactionSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that receives the prompt on stdin (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Calls per iteration when responses violate the action protocol.
    pub max_attempts: u32,
    /// Exploration intensity used until a loop intervention raises it.
    pub base_temperature: f64,
    pub prompt_budget_bytes: usize,
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 180,
            max_attempts: 3,
            base_temperature: 0.0,
            prompt_budget_bytes: 60_000,
            output_limit_bytes: 200_000,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    /// Shell used by local sessions (`<shell> -c <command>`).
    pub shell: String,
    /// Bytes of stdout and stderr captured per command.
    pub capture_limit_bytes: usize,
    #[serde(flatten)]
    pub timeouts: CommandTimeouts,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            capture_limit_bytes: 200_000,
            timeouts: CommandTimeouts::default(),
        }
    }
}

/// What happens when nobody answers the ask-human loop tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerTimeoutPolicy {
    #[default]
    Abort,
    /// Keep iterating autonomously; the iteration budget still applies.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterventionConfig {
    /// Temperature per escalation tier, lowest tier first.
    pub temperature_ladder: Vec<f64>,
    pub on_handler_timeout: HandlerTimeoutPolicy,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            temperature_ladder: vec![0.3, 0.5, 0.7],
            on_handler_timeout: HandlerTimeoutPolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    /// Bytes of stdout kept per command in the run log.
    pub stdout_bytes: usize,
    /// Bytes of stderr kept per command in the run log.
    pub stderr_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("deploy_logs"),
            stdout_bytes: 1000,
            stderr_bytes: 500,
        }
    }
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_step: 15,
            max_step_retries: 2,
            oracle: OracleConfig::default(),
            commands: CommandsConfig::default(),
            loop_detection: LoopDetectionSettings::default(),
            intervention: InterventionConfig::default(),
            summary: SummaryLimits::default(),
            compaction: CompactionSettings::default(),
            log: LogConfig::default(),
        }
    }
}

impl DeployerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations_per_step == 0 {
            return Err(anyhow!("max_iterations_per_step must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.max_attempts == 0 {
            return Err(anyhow!("oracle.max_attempts must be > 0"));
        }
        if self.oracle.prompt_budget_bytes == 0 || self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle byte limits must be > 0"));
        }
        let timeouts = &self.commands.timeouts;
        if timeouts.total_timeout_secs == 0
            || timeouts.idle_timeout_secs == 0
            || timeouts.long_running_total_secs == 0
            || timeouts.long_running_idle_secs == 0
            || timeouts.follow_idle_secs == 0
        {
            return Err(anyhow!("commands timeouts must be > 0"));
        }
        if self.commands.capture_limit_bytes == 0 {
            return Err(anyhow!("commands.capture_limit_bytes must be > 0"));
        }
        if self.commands.shell.trim().is_empty() {
            return Err(anyhow!("commands.shell must not be empty"));
        }
        let detection = &self.loop_detection;
        for (name, value) in [
            ("command_similarity", detection.command_similarity),
            ("output_similarity", detection.output_similarity),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("loop_detection.{name} must be in (0, 1]"));
            }
        }
        if detection.direct_repeat_window < 2 || detection.error_loop_window < 2 {
            return Err(anyhow!("loop_detection windows must be >= 2"));
        }
        if self.intervention.temperature_ladder.is_empty() {
            return Err(anyhow!("intervention.temperature_ladder must not be empty"));
        }
        if self.summary.max_completed_actions == 0 || self.summary.max_environment_keys == 0 {
            return Err(anyhow!("summary caps must be > 0"));
        }
        if !(self.compaction.keep_ratio > 0.0 && self.compaction.keep_ratio <= 1.0) {
            return Err(anyhow!("compaction.keep_ratio must be in (0, 1]"));
        }
        if self.compaction.trigger_tokens == 0 {
            return Err(anyhow!("compaction.trigger_tokens must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DeployerConfig::default()`.
pub fn load_config(path: &Path) -> Result<DeployerConfig> {
    if !path.exists() {
        let cfg = DeployerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DeployerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DeployerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, DeployerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("deployer.toml");
        let mut cfg = DeployerConfig::default();
        cfg.intervention.on_handler_timeout = HandlerTimeoutPolicy::Continue;
        cfg.commands.timeouts.idle_timeout_secs = 45;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("deployer.toml.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("deployer.toml");
        fs::write(
            &path,
            concat!(
                "max_iterations_per_step = 20\n\n",
                "[commands]\nidle_timeout_secs = 30\n\n",
                "[intervention]\non_handler_timeout = \"continue\"\n",
            ),
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations_per_step, 20);
        assert_eq!(cfg.commands.timeouts.idle_timeout_secs, 30);
        assert_eq!(cfg.commands.timeouts.total_timeout_secs, 600);
        assert_eq!(cfg.commands.shell, "bash");
        assert_eq!(cfg.intervention.on_handler_timeout, HandlerTimeoutPolicy::Continue);
        assert_eq!(cfg.loop_detection.error_loop_window, 4);
        assert_eq!(cfg.log.stderr_bytes, 500);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = DeployerConfig::default();
        cfg.loop_detection.command_similarity = 1.5;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("command_similarity"));
    }

    #[test]
    fn rejects_empty_ladder() {
        let mut cfg = DeployerConfig::default();
        cfg.intervention.temperature_ladder.clear();
        assert!(cfg.validate().is_err());
    }
}
