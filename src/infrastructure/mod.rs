//! Infrastructure layer
//!
//! Configuration, logging and metrics.

mod config;
mod logging;
pub mod metrics;

pub use config::{
    Config, ConfigError, ENV_ARTIFACT_DIR, ENV_CONTAINER_CLI, ENV_LOG, ENV_SHELL,
};
pub use logging::init_logging;
pub use metrics::{MetricsCollector, RunMetrics, StepMetrics};
