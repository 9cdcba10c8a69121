//! Stable exit codes for deployer CLI commands.

/// Deployment completed, plan is valid, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid plan, config, arguments, or another error before the run started.
pub const INVALID: i32 = 1;
/// A step failed and the deployment stopped.
pub const FAILED: i32 = 2;
/// The operator aborted the deployment or could not be reached.
pub const ABORTED: i32 = 3;
