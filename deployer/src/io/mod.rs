//! Side-effecting operations: processes, sessions, oracle calls, files, prompts.

pub mod config;
pub mod interaction;
pub mod oracle;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod session;
