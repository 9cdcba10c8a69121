//! Step orchestration and safe command execution for multi-step deployments.
//!
//! A deployment plan is walked step by step. For every step an external
//! decision oracle proposes one action at a time (run a command, declare the
//! step done or failed, ask the operator) until the step resolves. The crate
//! keeps that loop bounded and safe:
//!
//! - **[`core`]**: Pure, deterministic logic (loop detection, escalation
//!   ladder, summaries, compaction, action parsing). No I/O, fully testable
//!   in isolation.
//! - **[`io`]**: Side-effecting operations (child processes with idle/total
//!   timeouts, local and SSH sessions, oracle calls, prompts, config, plan
//!   files, the persisted run log). Behind traits where tests need doubles.
//!
//! [`step`] drives one step; [`orchestrator`] walks the plan and applies the
//! retry/skip/abort policy.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
