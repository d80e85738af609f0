//! Tracing setup for the planner
//!
//! Events go to stderr so plan output on stdout stays machine readable.

use tracing_subscriber::EnvFilter;

const FALLBACK_LEVEL: &str = "info";

/// Filter from `RUST_LOG`, else `level`, else `info` when `level` is not a
/// valid directive
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Initializes logging with the specified level.
///
/// Calling it again once a subscriber is installed has no effect.
pub fn init_logging(level: &str) {
    use std::io::IsTerminal;
    use tracing_subscriber::fmt;

    let installed = fmt()
        .with_env_filter(log_filter(level))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
    if installed.is_ok() {
        tracing::debug!(level, "Logging initialized");
    }
}
