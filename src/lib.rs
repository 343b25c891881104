//! # Buildline - an execution engine for declarative build pipelines
//!
//! A pipeline definition declares ordered steps, triggers, features and
//! artifact rules. Buildline turns those declarations into runs:
//!
//! - **Parameters**: `%name%` placeholders resolved from computed, build
//!   and environment scopes, with nesting and cycle detection
//! - **Steps**: scripts, container CLI commands, remote sessions and build
//!   tool invocations, each `normal` or `always`
//! - **Runs**: a `Pending → Running → Succeeded | Failed | Error` state
//!   machine with per-step timeouts and cooperative cancellation
//! - **Triggers**: change events coalesced into at most one pending run per
//!   definition
//! - **Artifacts**: `src => dest` glob rules applied to the workspace after
//!   every run
//!
//! ## Quick Start
//!
//! ```no_run
//! use buildline::prelude::*;
//! use std::collections::BTreeMap;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = PipelineDefinition::builder("images")
//!     .parameter("TAG", "%build.number%")
//!     .step(Step::container_command("build", "-t app:%TAG% .").with_name("build"))
//!     .step(Step::container_command("push", "app:%TAG%").with_name("push"))
//!     .step(Step::script("docker image prune -f").always())
//!     .build()?;
//!
//! let executor = Executor::new(
//!     Arc::new(LocalRuntime::default()),
//!     Arc::new(SshRuntime::default()),
//! );
//! let workspace = Path::new(".");
//! let run = PipelineRun::new("images", definition.version, RunCause::Manual);
//! let scope = executor.build_scope(&definition, &run, workspace, &BTreeMap::new());
//! let run = executor
//!     .execute(run, &definition, &scope, workspace, &CancelHandle::new())
//!     .await?;
//! println!("{run}");
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! Licensed under either of
//! - Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <https://www.apache.org/licenses/LICENSE-2.0>)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or <https://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod artifacts;
pub mod executor;
pub mod infrastructure;
pub mod pipeline;
pub mod scheduler;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use artifacts::{ArtifactCollector, ArtifactManifest, ArtifactStore};
pub use executor::{CancelHandle, Executor, ParameterScope, ResolveError};
pub use infrastructure::{Config, MetricsCollector};
pub use pipeline::{
    ExecutionMode, PipelineBuilder, PipelineDefinition, PipelineRun, RunStatus, Step, StepKind,
    Trigger, Validate,
};
pub use scheduler::{Dispatcher, TriggerEvaluator};

/// Version of the buildline crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
