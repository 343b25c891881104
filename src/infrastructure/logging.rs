//! Logging configuration
//!
//! Initializes tracing for the application. `BUILDLINE_LOG` takes precedence
//! over `RUST_LOG`, which takes precedence over the configured level.

use super::config::ENV_LOG;

/// Initializes logging with the specified level
///
/// Later calls are no-ops.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_line_number(true)
        .try_init();
}
