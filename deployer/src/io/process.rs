//! Helpers for running child processes with timeouts and bounded output.
//!
//! Two runners share the same pipe-draining approach (one reader thread per
//! stream, bounded in-memory capture):
//!
//! - [`run_command_with_timeout`] feeds stdin and enforces a single wall-clock
//!   limit. Used for oracle invocations.
//! - [`run_command_streaming`] enforces both an idle window (no output) and a
//!   total limit. Used for deployment commands, which may hang on prompts.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::CommandBudget;
use crate::core::types::TimeoutKind;

/// How often timers are re-checked while no output arrives.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Output still drained after the main process exited (grandchildren may hold the pipes).
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// Time allowed to reap a killed child before giving up on it.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs and stdin is written from
/// its own thread, so neither a chatty child nor one that never reads its input
/// can stall the wait. On timeout the whole process group is killed; output
/// still held open by a surviving grandchild is drained for at most a short
/// grace period. `output_limit_bytes` bounds the amount of stdout/stderr stored
/// in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_chunk_reader(stdout, Stream::Stdout, tx.clone());
    spawn_chunk_reader(stderr, Stream::Stderr, tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child closed stdin early");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Some(status),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_and_reap(&mut child)
        }
    };

    let mut capture = Capture::new(output_limit_bytes);
    drain_until_closed(&rx, &mut capture, DRAIN_GRACE);
    let status = status.ok_or_else(|| anyhow!("timed out command could not be reaped"))?;

    if capture.stdout_truncated > 0 || capture.stderr_truncated > 0 {
        warn!(
            stdout_truncated = capture.stdout_truncated,
            stderr_truncated = capture.stderr_truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: capture.stdout,
        stderr: capture.stderr,
        stdout_truncated: capture.stdout_truncated,
        stderr_truncated: capture.stderr_truncated,
        timed_out,
    })
}

/// Append up to `limit` total bytes, returning how many were discarded.
fn append_limited(buf: &mut Vec<u8>, bytes: &[u8], limit: usize) -> usize {
    let remaining = limit.saturating_sub(buf.len());
    let keep = bytes.len().min(remaining);
    buf.extend_from_slice(&bytes[..keep]);
    bytes.len() - keep
}

/// Output of a command run under idle + total timeouts.
#[derive(Debug)]
pub struct StreamedOutput {
    /// `None` when the child was killed and could not be reaped in time.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timeout: Option<TimeoutKind>,
    pub elapsed: Duration,
}

impl StreamedOutput {
    /// Exit code, with signal deaths mapped to `128 + signal` on unix.
    pub fn exit_code(&self) -> Option<i32> {
        let status = self.status?;
        if let Some(code) = status.code() {
            return Some(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(|sig| 128 + sig)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Stream, Vec<u8>),
    Closed(Stream),
}

/// Run a command, killing it when it stays silent for `budget.idle` or runs
/// longer than `budget.total`.
///
/// Timeouts are reported in [`StreamedOutput::timeout`], never as errors. The
/// call returns within `budget.total` plus a small reaping margin even if the
/// process (or a grandchild holding its pipes) never closes its output.
/// Errors are returned only when the command cannot be started.
#[instrument(
    skip_all,
    fields(total_secs = budget.total.as_secs(), idle_secs = budget.idle.as_secs())
)]
pub fn run_command_streaming(
    mut cmd: Command,
    budget: CommandBudget,
    capture_limit_bytes: usize,
) -> Result<StreamedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so a timeout can take down the whole pipeline.
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_chunk_reader(stdout, Stream::Stdout, tx.clone());
    spawn_chunk_reader(stderr, Stream::Stderr, tx);

    let mut capture = Capture::new(capture_limit_bytes);
    let mut last_activity = start;
    let mut open_streams = 2u8;
    let mut status: Option<ExitStatus> = None;
    let mut exited_at: Option<Instant> = None;

    let timeout = loop {
        let now = Instant::now();
        if let Some(exited) = exited_at {
            if open_streams == 0 {
                break None;
            }
            if now.duration_since(exited) >= DRAIN_GRACE {
                debug!("process exited but pipes stayed open; detaching readers");
                break None;
            }
        } else {
            if now.duration_since(start) >= budget.total {
                break Some(TimeoutKind::Total);
            }
            if now.duration_since(last_activity) >= budget.idle {
                break Some(TimeoutKind::Idle);
            }
        }

        if open_streams > 0 {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Chunk::Data(stream, bytes)) => {
                    last_activity = Instant::now();
                    capture.push(stream, &bytes);
                }
                Ok(Chunk::Closed(_)) => open_streams -= 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => open_streams = 0,
            }
            if exited_at.is_none()
                && let Some(s) = child.try_wait().context("poll command")?
            {
                status = Some(s);
                exited_at = Some(Instant::now());
            }
        } else if exited_at.is_none()
            && let Some(s) = child.wait_timeout(POLL_INTERVAL).context("wait for command")?
        {
            status = Some(s);
            exited_at = Some(Instant::now());
        }
    };

    if let Some(kind) = timeout {
        warn!(
            timeout = ?kind,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "command timed out, killing"
        );
        status = kill_and_reap(&mut child);
        drain_pending(&rx, &mut capture);
    }

    if capture.stdout_truncated > 0 || capture.stderr_truncated > 0 {
        warn!(
            stdout_truncated = capture.stdout_truncated,
            stderr_truncated = capture.stderr_truncated,
            "output truncated"
        );
    }
    let elapsed = start.elapsed();
    debug!(
        exit_code = ?status.and_then(|s| s.code()),
        ?timeout,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );
    Ok(StreamedOutput {
        status,
        stdout: capture.stdout,
        stderr: capture.stderr,
        stdout_truncated: capture.stdout_truncated,
        stderr_truncated: capture.stderr_truncated,
        timeout,
        elapsed,
    })
}

struct Capture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: usize,
    stderr_truncated: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
        }
    }

    fn push(&mut self, stream: Stream, bytes: &[u8]) {
        match stream {
            Stream::Stdout => {
                self.stdout_truncated += append_limited(&mut self.stdout, bytes, self.limit);
            }
            Stream::Stderr => {
                self.stderr_truncated += append_limited(&mut self.stderr, bytes, self.limit);
            }
        }
    }
}

fn spawn_chunk_reader<R: Read + Send + 'static>(mut reader: R, stream: Stream, tx: Sender<Chunk>) {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Chunk::Data(stream, chunk[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(err = %e, ?stream, "output reader stopped");
                    break;
                }
            }
        }
        let _ = tx.send(Chunk::Closed(stream));
    });
}

/// Collect output until both streams close or `grace` elapses.
fn drain_until_closed(rx: &Receiver<Chunk>, capture: &mut Capture, grace: Duration) {
    let deadline = Instant::now() + grace;
    let mut open_streams = 2u8;
    while open_streams > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("output pipes stayed open; detaching readers");
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(Chunk::Data(stream, bytes)) => capture.push(stream, &bytes),
            Ok(Chunk::Closed(_)) => open_streams -= 1,
            Err(RecvTimeoutError::Timeout) => {
                debug!("output pipes stayed open; detaching readers");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Collect whatever the readers already queued without waiting for more.
fn drain_pending(rx: &Receiver<Chunk>, capture: &mut Capture) {
    while let Ok(chunk) = rx.try_recv() {
        if let Chunk::Data(stream, bytes) = chunk {
            capture.push(stream, &bytes);
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    kill_process_group(child.id());
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed (process may have exited)");
    }
    match child.wait_timeout(REAP_TIMEOUT) {
        Ok(Some(status)) => Some(status),
        Ok(None) => {
            warn!(pid = child.id(), "killed process was not reaped in time");
            None
        }
        Err(e) => {
            warn!(err = %e, "wait after kill failed");
            None
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        debug!(err = %e, pid, "process group kill failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = run_command_streaming(
            bash("echo out; echo err >&2; exit 3"),
            CommandBudget::from_secs(10, 5),
            1024,
        )
        .expect("run");
        assert_eq!(out.exit_code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "err\n");
        assert!(out.timeout.is_none());
    }

    #[test]
    fn capture_limit_counts_discarded_bytes() {
        let out = run_command_streaming(
            bash("printf '%0100d' 0"),
            CommandBudget::from_secs(10, 5),
            10,
        )
        .expect("run");
        assert_eq!(out.stdout.len(), 10);
        assert_eq!(out.stdout_truncated, 90);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let result = run_command_streaming(
            Command::new("/definitely/not/a/program"),
            CommandBudget::from_secs(1, 1),
            10,
        );
        assert!(result.is_err());
    }

    #[test]
    fn stdin_is_closed_for_streaming_commands() {
        let out = run_command_streaming(
            bash("cat; echo done"),
            CommandBudget::from_secs(10, 5),
            1024,
        )
        .expect("run");
        assert!(out.timeout.is_none());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "done\n");
    }

    #[test]
    fn timeout_runner_feeds_stdin() {
        let out = run_command_with_timeout(
            bash("cat"),
            Some(b"prompt text"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.stdout, b"prompt text");
    }

    #[test]
    fn timeout_runner_kills_grandchildren_holding_pipes() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            bash("sleep 20 & sleep 20"),
            None,
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    }

    #[test]
    fn timeout_runner_survives_child_that_never_reads_stdin() {
        let prompt = vec![b'x'; 1 << 20];
        let started = Instant::now();
        let out = run_command_with_timeout(
            bash("sleep 20"),
            Some(&prompt),
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    }
}
