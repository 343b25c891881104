//! Prelude module for common imports

// Re-export all pipeline types
pub use crate::pipeline::{
    ArtifactRule, ContainerSettings, ExecutionMode, Feature, PipelineBuilder, PipelineDefinition,
    PipelineError, PipelineRun, RemoteTarget, RunCause, RunStatus, Step, StepKind, StepResult,
    StepStatus, Trigger, Validate, ValidationError,
};

// Re-export executor types
pub use crate::executor::{
    CancelHandle, Executor, ExecutorConfig, LocalRuntime, ParameterScope, ProcessRuntime,
    RemoteRuntime, ResolveError, SshRuntime,
};

// Re-export scheduling and artifact types
pub use crate::artifacts::{ArtifactCollector, ArtifactManifest, ArtifactStore, FsArtifactStore};
pub use crate::scheduler::{
    DefinitionRegistry, Dispatcher, EnqueueDecision, TriggerEvaluator, VcsChangeEvent,
};
