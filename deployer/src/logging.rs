//! Development-time tracing for debugging deployments.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Operator and developer diagnostics via
//!   `RUST_LOG`, output to stderr. Not persisted.
//!
//! - **Run log (`io/run_log`)**: Product artifact under the configured log
//!   directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `deployer=info`, or `deployer=debug` when
/// `verbose` is set. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=deployer=trace deployer run --plan plan.toml
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "deployer=debug" } else { "deployer=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
