//! Runtime collaborator contracts
//!
//! The executor never spawns processes itself. It hands fully resolved
//! invocations to a [`ProcessRuntime`] (local and containerized commands) or
//! a [`RemoteRuntime`] (remote sessions) and interprets their results.

use crate::pipeline::{ContainerSettings, Feature, RemoteTarget};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Failure to run a command at all (as opposed to a non-zero exit)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Program could not be spawned
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn {
        /// Program that was requested
        program: String,
        /// OS error text
        reason: String,
    },

    /// Invocation was malformed (bad quoting, missing target, ...)
    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    /// IO error while talking to the process
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Exit code and captured output of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    /// Exit code (-1 when terminated by a signal)
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl ProcessOutput {
    /// Returns true if the command exited with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A resolved local command, optionally wrapped in a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Script text run by a shell
    Script {
        /// Script body
        content: String,
    },
    /// Program with argument vector
    Program {
        /// Executable
        program: String,
        /// Arguments
        args: Vec<String>,
    },
    /// Subcommand of the configured container CLI
    ContainerCli {
        /// Arguments after the CLI name, subcommand first
        args: Vec<String>,
    },
}

/// Everything a [`ProcessRuntime`] needs to run one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// What to run
    pub invocation: Invocation,
    /// Container wrapping the invocation
    pub container: Option<ContainerSettings>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Ordinal of the step issuing the request
    pub ordinal: usize,
}

/// Everything a [`RemoteRuntime`] needs to run one remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    /// Host, user and credential reference
    pub target: RemoteTarget,
    /// Command text
    pub commands: String,
    /// Extra environment exported before the commands
    pub env: BTreeMap<String, String>,
}

/// Read-only facts about the run a step belongs to
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run id
    pub run_id: Uuid,
    /// Definition name
    pub definition: String,
    /// Run number
    pub number: u64,
    /// Run workspace
    pub workspace: PathBuf,
    /// Features declared by the definition
    pub features: Vec<Feature>,
}

impl RunContext {
    /// Creates a context for a run of `definition` in `workspace`
    #[must_use]
    pub fn new(definition: impl Into<String>, number: u64, workspace: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            definition: definition.into(),
            number,
            workspace: workspace.into(),
            features: Vec::new(),
        }
    }

    /// Returns true if the definition asked for a clean checkout
    #[must_use]
    pub fn clean_checkout(&self) -> bool {
        self.features
            .iter()
            .any(|f| matches!(f, Feature::CleanCheckout { force: true, .. }))
    }
}

/// Runs local and containerized commands
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// Runs the request to completion
    async fn run(&self, request: &ProcessRequest, ctx: &RunContext)
    -> Result<ProcessOutput, RuntimeError>;

    /// Releases what a request left running after it timed out
    ///
    /// Awaited before the next step starts.
    async fn abandon(&self, _request: &ProcessRequest, _ctx: &RunContext) {}
}

/// Runs commands in remote sessions
#[async_trait]
pub trait RemoteRuntime: Send + Sync {
    /// Runs the request to completion
    async fn run(&self, request: &RemoteRequest, ctx: &RunContext)
    -> Result<ProcessOutput, RuntimeError>;
}
