//! Configuration management
//!
//! Configuration is read from a YAML file, then environment overrides are
//! applied. Every field has a default so partial files are accepted.

use crate::executor::{ExecutorConfig, ShellConfig, SshConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`Config::shell`]
pub const ENV_SHELL: &str = "BUILDLINE_SHELL";
/// Environment variable overriding [`Config::container_cli`]
pub const ENV_CONTAINER_CLI: &str = "BUILDLINE_CONTAINER_CLI";
/// Environment variable overriding [`Config::log_level`]
pub const ENV_LOG: &str = "BUILDLINE_LOG";
/// Environment variable overriding [`Config::artifact_dir`]
pub const ENV_ARTIFACT_DIR: &str = "BUILDLINE_ARTIFACT_DIR";

/// Configuration loading errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path}: {reason}")]
    Io {
        /// Config path
        path: String,
        /// OS error text
        reason: String,
    },

    /// File is not valid YAML for [`Config`]
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell used for script steps
    pub shell: String,
    /// Container CLI (docker or podman)
    pub container_cli: String,
    /// ssh client for remote steps
    pub ssh_cli: String,
    /// Directory in which remote credential references are looked up
    pub ssh_key_dir: Option<PathBuf>,
    /// Timeout for steps that declare none
    pub default_step_timeout_secs: Option<u64>,
    /// Quiet period for triggers that declare none
    pub quiet_period_secs: u64,
    /// Runs executing at once across definitions
    pub max_concurrent_runs: usize,
    /// Root of per-definition workspaces
    pub workspace_root: PathBuf,
    /// Root of stored artifacts
    pub artifact_dir: PathBuf,
    /// Endpoint receiving artifact manifests, instead of `artifact_dir`
    pub artifact_endpoint: Option<String>,
    /// Expose the process environment as `env.*` parameters
    pub inherit_env: bool,
    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            container_cli: "docker".to_string(),
            ssh_cli: "ssh".to_string(),
            ssh_key_dir: None,
            default_step_timeout_secs: None,
            quiet_period_secs: 0,
            max_concurrent_runs: 2,
            workspace_root: PathBuf::from(".buildline/workspaces"),
            artifact_dir: PathBuf::from(".buildline/artifacts"),
            artifact_endpoint: None,
            inherit_env: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parses a YAML document
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&source)
    }

    /// Applies overrides from the process environment
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides found through `lookup`
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(shell) = non_empty(ENV_SHELL) {
            self.shell = shell;
        }
        if let Some(cli) = non_empty(ENV_CONTAINER_CLI) {
            self.container_cli = cli;
        }
        if let Some(level) = non_empty(ENV_LOG) {
            self.log_level = level;
        }
        if let Some(dir) = non_empty(ENV_ARTIFACT_DIR) {
            self.artifact_dir = PathBuf::from(dir);
        }
        self
    }

    /// Checks value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero concurrency limit or
    /// step timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.default_step_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "default_step_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout for steps that declare none
    #[must_use]
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs.map(Duration::from_secs)
    }

    /// Quiet period for triggers that declare none
    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_secs)
    }

    /// Local runtime settings
    #[must_use]
    pub fn shell_config(&self) -> ShellConfig {
        ShellConfig {
            shell: self.shell.clone(),
            container_cli: self.container_cli.clone(),
            ..ShellConfig::default()
        }
    }

    /// Remote runtime settings
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            program: self.ssh_cli.clone(),
            key_dir: self.ssh_key_dir.clone(),
        }
    }

    /// Executor settings
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_step_timeout: self.default_step_timeout(),
            inherit_env: self.inherit_env,
        }
    }
}
