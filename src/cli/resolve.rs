//! `buildline resolve` - Show a definition with every parameter resolved
//!
//! Dry run: nothing executes. Useful to check what a run would do with a
//! set of parameter overrides.
//!
//! ## Usage
//!
//! ```bash
//! buildline resolve pipeline.yaml --param DOCKER_TAG=1.2.3 --revision abc123
//! ```

use anyhow::{Context, Result};
use buildline::executor::{Executor, ResolvedStep};
use buildline::pipeline::{PipelineDefinition, PipelineRun, RunCause, StepKind};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Formats a resolved step for display
pub fn describe_step(step: &ResolvedStep) -> String {
    let mut line = format!("{} [{}] ", step.step, step.mode);
    let _ = match &step.kind {
        StepKind::Script { content } => write!(line, "script: {}", content.trim()),
        StepKind::ContainerCommand { subcommand, args } => {
            write!(line, "container {subcommand} {args}")
        }
        StepKind::RemoteCommand { commands } => {
            let host = step
                .side_effects
                .remote
                .as_ref()
                .map_or("?", |r| r.host.as_str());
            write!(line, "remote {host}: {}", commands.trim())
        }
        StepKind::ToolInvocation {
            tool,
            targets,
            args,
            ..
        } => write!(line, "tool {tool} {targets} {args}"),
    };
    if let Some(container) = &step.side_effects.container {
        let _ = write!(line, " (in {})", container.image);
    }
    line.trim_end().to_string()
}

/// Resolves `file` and prints the resolved parameters and steps
pub fn resolve_pipeline(
    executor: &Executor,
    file: &Path,
    workspace: &Path,
    overrides: &BTreeMap<String, String>,
    revision: Option<String>,
) -> Result<()> {
    let definition = PipelineDefinition::from_path(file)
        .with_context(|| format!("Failed to load definition: {}", file.display()))?;

    let cause = match revision {
        Some(revision) => RunCause::VcsChange {
            revision,
            branch: None,
            coalesced: 0,
        },
        None => RunCause::Manual,
    };
    let mut run = PipelineRun::new(definition.name.clone(), definition.version, cause);
    run.number = 1;

    let scope = executor.build_scope(&definition, &run, workspace, overrides);
    let parameters = scope
        .resolved_build_parameters()
        .context("Failed to resolve build parameters")?;
    let steps = executor
        .plan(&definition, &scope)
        .context("Failed to resolve steps")?;

    println!("{definition}");
    if !parameters.is_empty() {
        println!("parameters:");
        for (name, value) in &parameters {
            println!("  {name} = {value}");
        }
    }
    println!("steps:");
    for step in &steps {
        println!("  {}", describe_step(step));
    }
    Ok(())
}
