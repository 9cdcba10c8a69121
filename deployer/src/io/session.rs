//! Command execution sessions: where and how deployment commands run.
//!
//! The [`CommandSession`] trait decouples the step executor from the transport.
//! Local and SSH sessions differ only in how the child process is launched;
//! both run through the same idle/total timeout algorithm in
//! [`run_with_timeouts`].

use std::path::PathBuf;
use std::process::Command;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::budget::CommandBudget;
use crate::core::types::{
    CommandOutcome, IDLE_TIMEOUT_EXIT_CODE, TOTAL_TIMEOUT_EXIT_CODE, TimeoutKind,
};
use crate::io::process::{StreamedOutput, run_command_streaming};

/// Tool directories commonly missing from non-login shells.
const EXTRA_PATH_DIRS: &[&str] = &["/usr/local/bin", "/usr/local/sbin", "/snap/bin"];

/// Runs one shell command to completion or timeout.
pub trait CommandSession {
    /// Human-readable target description for logs and prompts.
    fn describe(&self) -> String;

    /// Run `command` under `budget`. Never fails: launch errors and timeouts
    /// are reported in the returned outcome.
    fn run(&self, command: &str, budget: CommandBudget) -> CommandOutcome;
}

/// Run a launched command with the idle/total timeout algorithm.
#[instrument(
    skip_all,
    fields(
        target = %target,
        total_secs = budget.total.as_secs(),
        idle_secs = budget.idle.as_secs()
    )
)]
pub fn run_with_timeouts(
    target: &str,
    command: &str,
    launcher: Command,
    budget: CommandBudget,
    capture_limit_bytes: usize,
) -> CommandOutcome {
    let started = Utc::now();
    info!(command, "running command");
    match run_command_streaming(launcher, budget, capture_limit_bytes) {
        Ok(output) => {
            let outcome = outcome_from_output(output, budget);
            info!(
                exit_code = outcome.exit_code,
                timeout = ?outcome.timeout,
                duration_ms = outcome.duration_ms,
                "command finished"
            );
            outcome
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "command could not be started");
            let reason = format!("failed to start command on {target}: {err:#}");
            let mut outcome = CommandOutcome::launch_failure(reason);
            outcome.duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
            outcome
        }
    }
}

/// Map raw process output to a command outcome, explaining timeouts in stderr.
pub fn outcome_from_output(output: StreamedOutput, budget: CommandBudget) -> CommandOutcome {
    let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = match output.timeout {
        Some(TimeoutKind::Idle) => {
            append_line(
                &mut stderr,
                &format!(
                    "IDLE_TIMEOUT: No output for {} seconds. The command may be waiting for \
                     interactive input (password, confirmation, pager). Use non-interactive \
                     flags such as -y or --yes, or run long tasks in the background.",
                    budget.idle.as_secs()
                ),
            );
            IDLE_TIMEOUT_EXIT_CODE
        }
        Some(TimeoutKind::Total) => {
            append_line(
                &mut stderr,
                &format!(
                    "TOTAL_TIMEOUT: Command exceeded {} seconds and was terminated. Run \
                     long-lived processes in the background or split the work.",
                    budget.total.as_secs()
                ),
            );
            TOTAL_TIMEOUT_EXIT_CODE
        }
        None => output.exit_code().unwrap_or(-1),
    };
    CommandOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
        exit_code,
        timeout: output.timeout,
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
        duration_ms: output.elapsed.as_millis() as u64,
    }
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
}

/// Runs commands with a local shell.
#[derive(Debug, Clone)]
pub struct LocalSession {
    pub shell: String,
    pub workdir: PathBuf,
    pub capture_limit_bytes: usize,
}

impl LocalSession {
    pub fn new(
        shell: impl Into<String>,
        workdir: impl Into<PathBuf>,
        capture_limit_bytes: usize,
    ) -> Self {
        Self {
            shell: shell.into(),
            workdir: workdir.into(),
            capture_limit_bytes,
        }
    }

    /// `<shell> -c <command>` in the working directory.
    pub fn launcher(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).current_dir(&self.workdir);
        if let Some(path) = std::env::var_os("PATH") {
            let mut dirs: Vec<PathBuf> = EXTRA_PATH_DIRS.iter().map(PathBuf::from).collect();
            dirs.extend(std::env::split_paths(&path));
            if let Ok(joined) = std::env::join_paths(dirs) {
                cmd.env("PATH", joined);
            }
        }
        cmd.env("DEBIAN_FRONTEND", "noninteractive");
        cmd
    }
}

impl CommandSession for LocalSession {
    fn describe(&self) -> String {
        format!("local:{}", self.workdir.display())
    }

    fn run(&self, command: &str, budget: CommandBudget) -> CommandOutcome {
        run_with_timeouts(
            &self.describe(),
            command,
            self.launcher(command),
            budget,
            self.capture_limit_bytes,
        )
    }
}

/// Connection settings for [`SshSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Remote directory commands run in, if any.
    pub workdir: Option<String>,
}

impl SshTarget {
    /// Parse `user@host` (user defaults to `root`).
    pub fn parse(spec: &str) -> Self {
        let (user, host) = match spec.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => ("root".to_string(), spec.to_string()),
        };
        Self {
            host,
            user,
            port: 22,
            identity_file: None,
            connect_timeout_secs: 15,
            workdir: None,
        }
    }
}

/// Runs commands on a remote host through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshSession {
    pub target: SshTarget,
    pub capture_limit_bytes: usize,
}

impl SshSession {
    pub fn new(target: SshTarget, capture_limit_bytes: usize) -> Self {
        Self {
            target,
            capture_limit_bytes,
        }
    }

    /// Remote command line, prefixed with `cd <workdir> &&` when set.
    pub fn remote_command(&self, command: &str) -> String {
        match &self.target.workdir {
            Some(dir) => format!("cd {} && {}", shell_words::quote(dir), command),
            None => command.to_string(),
        }
    }

    /// `ssh` client invocation running `command` remotely.
    pub fn launcher(&self, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-T")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.target.connect_timeout_secs))
            .arg("-p")
            .arg(self.target.port.to_string());
        if let Some(identity) = &self.target.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.target.user, self.target.host))
            .arg("--")
            .arg(self.remote_command(command));
        cmd
    }
}

impl CommandSession for SshSession {
    fn describe(&self) -> String {
        format!("ssh:{}@{}:{}", self.target.user, self.target.host, self.target.port)
    }

    fn run(&self, command: &str, budget: CommandBudget) -> CommandOutcome {
        run_with_timeouts(
            &self.describe(),
            command,
            self.launcher(command),
            budget,
            self.capture_limit_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_session_runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let session = LocalSession::new("bash", temp.path(), 10_000);
        let outcome = session.run("cat marker.txt", CommandBudget::from_secs(10, 5));
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "here");
    }

    #[test]
    fn missing_shell_is_reported_as_failed_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = LocalSession::new("/no/such/shell", temp.path(), 10_000);
        let outcome = session.run("true", CommandBudget::from_secs(5, 5));
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.timeout.is_none());
        assert!(outcome.stderr.contains("failed to start command"));
    }

    #[test]
    fn ssh_launcher_builds_batch_mode_invocation() {
        let mut target = SshTarget::parse("deploy@10.0.0.5");
        target.port = 2222;
        target.identity_file = Some(PathBuf::from("/keys/id_ed25519"));
        target.workdir = Some("/srv/my app".to_string());
        let session = SshSession::new(target, 1000);

        let cmd = session.launcher("npm ci");
        assert_eq!(cmd.get_program(), "ssh");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert!(args.contains(&"deploy@10.0.0.5".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("cd '/srv/my app' && npm ci"));
    }

    #[test]
    fn ssh_target_defaults_to_root() {
        let target = SshTarget::parse("example.com");
        assert_eq!(target.user, "root");
        assert_eq!(target.port, 22);
    }
}
