//! Error types for pipeline domain

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or handling pipeline definitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Validation failed with specified reason
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Definition document could not be parsed
    #[error("Failed to parse definition: {0}")]
    Parse(String),

    /// Unsupported definition file format
    #[error("Unsupported definition format: '{0}' (expected .yaml, .yml or .json)")]
    UnsupportedFormat(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Validation errors for pipeline components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name cannot be empty
    #[error("Name cannot be empty")]
    EmptyName,

    /// Name too long
    #[error("Name too long: max {max} characters, got {len}")]
    NameTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length of the name.
        len: usize,
    },

    /// Invalid characters in name
    #[error("Invalid characters in name: '{name}'")]
    InvalidNameChars {
        /// The invalid name.
        name: String,
    },

    /// Two steps share the same id
    #[error("Duplicate step id '{id}' at ordinals {first} and {second}")]
    DuplicateStepId {
        /// The repeated id.
        id: String,
        /// Ordinal of the first occurrence.
        first: usize,
        /// Ordinal of the repeated occurrence.
        second: usize,
    },

    /// Step payload carries nothing to execute
    #[error("Step {ordinal} has an empty {field}")]
    EmptyPayload {
        /// Ordinal of the offending step.
        ordinal: usize,
        /// Name of the empty payload field.
        field: &'static str,
    },

    /// Remote command without a target host
    #[error("Step {ordinal} is a remote command without a host")]
    MissingRemoteHost {
        /// Ordinal of the offending step.
        ordinal: usize,
    },

    /// Invalid timeout value
    #[error("Invalid timeout: must be positive, got {value}")]
    InvalidTimeout {
        /// The invalid timeout value.
        value: u64,
    },

    /// Artifact rule could not be parsed
    #[error("Invalid artifact rule: '{0}'")]
    InvalidArtifactRule(String),

    /// Artifact rule source or destination leaves its root directory
    #[error("Artifact rule '{rule}' must use relative paths without '..'")]
    ArtifactPathEscapes {
        /// The offending rule.
        rule: String,
    },

    /// Glob pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Reason reported by the glob compiler.
        reason: String,
    },
}

/// Failure descriptor attached to a step result.
///
/// These never propagate out of step execution; the executor inspects them
/// to decide the run outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepError {
    /// Command ran and exited unsuccessfully
    #[error("Command failed with exit code {code}: {stderr}")]
    StepFailure {
        /// Exit code returned by the command.
        code: i32,
        /// Tail of the standard error output.
        stderr: String,
    },

    /// Step exceeded its time budget
    #[error("Step timed out after {secs}s")]
    StepTimeout {
        /// Budget that was exceeded, in seconds.
        secs: u64,
    },

    /// The runtime could not run the command at all
    #[error("Runtime error: {reason}")]
    Runtime {
        /// Runtime failure message.
        reason: String,
    },
}
