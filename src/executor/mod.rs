//! Pipeline execution layer
//!
//! Parameter resolution, the runtime collaborators that run commands, the
//! step runner and the run state machine.

mod engine;
mod params;
mod remote;
mod shell;
mod step;
mod traits;

pub use engine::{CancelHandle, Executor, ExecutorConfig};
pub use params::{ENV_PREFIX, MAX_RESOLUTION_DEPTH, ParameterScope, ParameterSource, ResolveError};
pub use remote::{SshConfig, SshDestination, SshRuntime};
pub use shell::{LocalRuntime, ShellConfig};
pub use step::{ResolvedStep, RuntimeRequest, StepRunner, tool_program};
pub use traits::{
    Invocation, ProcessOutput, ProcessRequest, ProcessRuntime, RemoteRequest, RemoteRuntime,
    RunContext, RuntimeError,
};
