//! `buildline run` - Execute a definition once
//!
//! ## Usage
//!
//! ```bash
//! buildline run pipeline.yaml --workspace . --param ENV=prod --revision abc123
//! # Exit code 0: run succeeded
//! # Exit code 1: run failed or errored
//! ```
//!
//! Ctrl-C requests cancellation: remaining normal steps are skipped and
//! cleanup steps still run.

use anyhow::{Context, Result};
use buildline::executor::{CancelHandle, Executor};
use buildline::pipeline::{PipelineDefinition, PipelineRun, RunCause, StepStatus};
use std::collections::BTreeMap;
use std::path::Path;

/// Options of a single run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Parameter overrides
    pub overrides: BTreeMap<String, String>,
    /// Revision being built
    pub revision: Option<String>,
    /// Print the finished run as JSON
    pub json: bool,
}

/// Runs `file` in `workspace` and prints the outcome
///
/// Returns `Ok(true)` if the run succeeded.
pub async fn run_pipeline(
    executor: &Executor,
    file: &Path,
    workspace: &Path,
    options: RunOptions,
) -> Result<bool> {
    let definition = PipelineDefinition::from_path(file)
        .with_context(|| format!("Failed to load definition: {}", file.display()))?;
    tokio::fs::create_dir_all(workspace)
        .await
        .with_context(|| format!("Failed to create workspace: {}", workspace.display()))?;

    let cause = match options.revision {
        Some(revision) => RunCause::VcsChange {
            revision,
            branch: None,
            coalesced: 0,
        },
        None => RunCause::Manual,
    };
    let mut run = PipelineRun::new(definition.name.clone(), definition.version, cause);
    run.number = 1;

    let scope = executor.build_scope(&definition, &run, workspace, &options.overrides);
    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let result = executor
        .execute(run, &definition, &scope, workspace, &cancel)
        .await;
    interrupt.abort();
    let run = result.context("Run could not start")?;

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&run).context("Failed to serialize run")?
        );
    } else {
        print!("{}", summarize(&run));
    }
    Ok(run.status().is_success())
}

/// Human-readable report of a finished run
pub fn summarize(run: &PipelineRun) -> String {
    let mut out = format!("{run}\n");
    for result in &run.results {
        let marker = match result.status {
            StepStatus::Success => "ok",
            StepStatus::Failure => "FAIL",
            StepStatus::Timeout => "TIMEOUT",
            StepStatus::Skipped => "skip",
        };
        out.push_str(&format!(
            "  {marker:<8}{} ({} ms)\n",
            result.step,
            result.duration().num_milliseconds()
        ));
        if let Some(error) = &result.error {
            out.push_str(&format!("          {error}\n"));
        }
    }
    if let Some(error) = &run.error {
        out.push_str(&format!("error: {error}\n"));
    }
    if let Some(manifest) = &run.artifacts {
        out.push_str(&format!("artifacts: {}\n", manifest.len()));
        for entry in &manifest.entries {
            out.push_str(&format!("  {} <- {}\n", entry.destination, entry.source));
        }
    }
    out
}
