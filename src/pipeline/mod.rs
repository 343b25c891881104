//! Pipeline domain types and logic

pub mod artifact_rule;
pub mod errors;
pub mod options;
pub mod pipeline_def;
pub mod run;
pub mod steps;
pub mod types;

pub use artifact_rule::ArtifactRule;
pub use errors::{PipelineError, StepError, ValidationError};
pub use options::{Feature, Trigger};
pub use pipeline_def::{PipelineBuilder, PipelineDefinition};
pub use run::{CapturedOutput, InvalidTransition, PipelineRun, RunCause, StepResult};
pub use steps::{
    ContainerSettings, ExecutionMode, RemoteTarget, SideEffects, Step, StepKind, StepRef,
};
pub use types::{RunStatus, StepStatus, Validate};
