//! Decision oracle abstraction.
//!
//! The [`DecisionOracle`] trait decouples the step executor from the model
//! backend. [`CommandOracle`] pipes the rendered prompt into an external
//! command and returns its stdout; tests use scripted oracles that return
//! predetermined responses without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::StepId;
use crate::io::process::run_command_with_timeout;

/// Everything the oracle is given to pick the next action.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub step_id: StepId,
    pub step_name: String,
    pub goal: String,
    pub success_criteria: String,
    /// Execution summary rendered for the prompt.
    pub summary: String,
    /// Command history view (digest plus recent commands).
    pub history: String,
    /// Reflection or guidance directive, if one is pending.
    pub directive: Option<String>,
    /// Exploration intensity for this call.
    pub temperature: f64,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Fully rendered prompt text.
    pub prompt: String,
}

/// Abstraction over decision backends. Returns the raw response text.
pub trait DecisionOracle {
    fn decide(&self, request: &OracleRequest) -> Result<String>;
}

/// Oracle that runs an external command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl DecisionOracle for CommandOracle {
    #[instrument(
        skip_all,
        fields(
            step_id = request.step_id,
            iteration = request.iteration,
            temperature = request.temperature
        )
    )]
    fn decide(&self, request: &OracleRequest) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        info!(program = %program, prompt_bytes = request.prompt.len(), "calling decision oracle");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("DEPLOYER_TEMPERATURE", format!("{:.2}", request.temperature))
            .env("DEPLOYER_STEP_ID", request.step_id.to_string())
            .env("DEPLOYER_ITERATION", request.iteration.to_string());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run oracle command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "oracle timed out");
            return Err(anyhow!("oracle timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "oracle failed");
            return Err(anyhow!(
                "oracle exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        let response = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(response_bytes = response.len(), "oracle responded");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> OracleRequest {
        OracleRequest {
            step_id: 7,
            step_name: "Install".to_string(),
            goal: "install".to_string(),
            success_criteria: "installed".to_string(),
            summary: String::new(),
            history: String::new(),
            directive: None,
            temperature: 0.5,
            iteration: 1,
            max_iterations: 10,
            prompt: prompt.to_string(),
        }
    }

    fn oracle(script: &str) -> CommandOracle {
        CommandOracle {
            command: vec!["bash".to_string(), "-c".to_string(), script.to_string()],
            workdir: None,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn prompt_goes_to_stdin_and_parameters_to_env() {
        let script = "read -r line; echo \"$line|$DEPLOYER_TEMPERATURE|$DEPLOYER_STEP_ID\"";
        let response = oracle(script).decide(&request("hello")).expect("decide");
        assert_eq!(response.trim(), "hello|0.50|7");
    }

    #[test]
    fn failing_command_is_an_error() {
        let err = oracle("echo broken >&2; exit 4")
            .decide(&request("x"))
            .expect_err("should fail");
        assert!(format!("{err:#}").contains("broken"));
    }

    #[test]
    fn empty_command_is_an_error() {
        let oracle = CommandOracle {
            command: Vec::new(),
            workdir: None,
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10,
        };
        assert!(oracle.decide(&request("x")).is_err());
    }

    #[test]
    fn timeout_holds_when_oracle_forks_background_work() {
        let oracle = CommandOracle {
            timeout: Duration::from_secs(1),
            ..oracle("sleep 20 & sleep 20")
        };
        let started = std::time::Instant::now();
        let err = oracle.decide(&request("x")).expect_err("should time out");
        assert!(format!("{err:#}").contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    }
}
