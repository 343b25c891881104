//! Step preparation and execution
//!
//! [`Step::prepare`] applies parameter resolution to every string of a step.
//! [`StepRunner::execute`] dispatches the resolved step to the matching
//! runtime and always returns a [`StepResult`]; failures are recorded, never
//! propagated.

use super::params::{ParameterScope, ResolveError};
use super::traits::{
    Invocation, ProcessRequest, ProcessRuntime, RemoteRequest, RemoteRuntime, RunContext,
    RuntimeError,
};
use crate::pipeline::{
    CapturedOutput, ExecutionMode, SideEffects, Step, StepError, StepKind, StepRef, StepResult,
    StepStatus,
};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const STDERR_TAIL_LINES: usize = 20;

/// A step whose payload and descriptors contain no placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    /// Step reference
    pub step: StepRef,
    /// Execution mode
    pub mode: ExecutionMode,
    /// Resolved payload
    pub kind: StepKind,
    /// Resolved side-effect descriptors
    pub side_effects: SideEffects,
    /// Declared timeout
    pub timeout: Option<Duration>,
}

impl Step {
    /// Resolves every parameter reference of this step
    ///
    /// # Errors
    ///
    /// Returns the first [`ResolveError`] met in payload or descriptors.
    pub fn prepare(
        &self,
        ordinal: usize,
        scope: &ParameterScope,
    ) -> Result<ResolvedStep, ResolveError> {
        let resolve = |text: &str| scope.resolve(text);
        Ok(ResolvedStep {
            step: StepRef::new(ordinal, self),
            mode: self.mode,
            kind: self.kind.try_map_strings(resolve)?,
            side_effects: self.side_effects.try_map_strings(resolve)?,
            timeout: self.timeout(),
        })
    }
}

/// Request routed to one of the runtimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeRequest {
    /// Local or containerized command
    Process(ProcessRequest),
    /// Remote session
    Remote(RemoteRequest),
}

/// Maps a build-tool name to the program that runs it
#[must_use]
pub fn tool_program(tool: &str, wrapper_path: Option<&str>) -> String {
    match tool.to_ascii_lowercase().as_str() {
        "maven" | "mvn" => "mvn".to_string(),
        "gradle" => match wrapper_path {
            Some(dir) => Path::new(dir).join("gradlew").to_string_lossy().into_owned(),
            None => "gradle".to_string(),
        },
        "ant" => "ant".to_string(),
        _ => tool.to_string(),
    }
}

fn split_args(text: &str, what: &str) -> Result<Vec<String>, RuntimeError> {
    shell_words::split(text)
        .map_err(|e| RuntimeError::InvalidInvocation(format!("{what}: {e}")))
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Executes resolved steps against the configured runtimes
#[derive(Clone)]
pub struct StepRunner {
    process: Arc<dyn ProcessRuntime>,
    remote: Arc<dyn RemoteRuntime>,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl StepRunner {
    /// Creates a runner
    #[must_use]
    pub fn new(process: Arc<dyn ProcessRuntime>, remote: Arc<dyn RemoteRuntime>) -> Self {
        Self {
            process,
            remote,
            default_timeout: None,
        }
    }

    /// Sets the timeout applied to steps that declare none
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Translates a resolved step into a runtime request
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidInvocation`] for unsplittable argument
    /// strings or a remote command without target.
    pub fn request_for(
        &self,
        step: &ResolvedStep,
        ctx: &RunContext,
    ) -> Result<RuntimeRequest, RuntimeError> {
        let effects = &step.side_effects;
        let cwd = match &effects.working_dir {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };
        let process = |invocation: Invocation| {
            RuntimeRequest::Process(ProcessRequest {
                invocation,
                container: effects.container.clone(),
                env: effects.env.clone(),
                cwd: cwd.clone(),
                ordinal: step.step.ordinal,
            })
        };

        Ok(match &step.kind {
            StepKind::Script { content } => process(Invocation::Script {
                content: content.clone(),
            }),
            StepKind::ContainerCommand { subcommand, args } => {
                let mut argv = vec![subcommand.clone()];
                argv.extend(split_args(args, "container command args")?);
                RuntimeRequest::Process(ProcessRequest {
                    invocation: Invocation::ContainerCli { args: argv },
                    container: None,
                    env: effects.env.clone(),
                    cwd: cwd.clone(),
                    ordinal: step.step.ordinal,
                })
            }
            StepKind::ToolInvocation {
                tool,
                targets,
                args,
                wrapper_path,
            } => {
                let mut argv = split_args(targets, "tool targets")?;
                argv.extend(split_args(args, "tool args")?);
                process(Invocation::Program {
                    program: tool_program(tool, wrapper_path.as_deref()),
                    args: argv,
                })
            }
            StepKind::RemoteCommand { commands } => {
                let target = effects.remote.clone().ok_or_else(|| {
                    RuntimeError::InvalidInvocation("remote command without target".to_string())
                })?;
                RuntimeRequest::Remote(RemoteRequest {
                    target,
                    commands: commands.clone(),
                    env: effects.env.clone(),
                })
            }
        })
    }

    /// Executes `step`, never failing past this boundary
    pub async fn execute(&self, step: &ResolvedStep, ctx: &RunContext) -> StepResult {
        let started_at = Utc::now();
        let timeout = step.timeout.or(self.default_timeout);

        tracing::info!(
            run = %ctx.run_id,
            step = step.step.ordinal,
            label = %step.step.label,
            kind = step.kind.kind_name(),
            mode = %step.mode,
            "Executing step"
        );

        let outcome = match self.request_for(step, ctx) {
            Ok(request) => {
                let fut = async {
                    match &request {
                        RuntimeRequest::Process(req) => self.process.run(req, ctx).await,
                        RuntimeRequest::Remote(req) => self.remote.run(req, ctx).await,
                    }
                };
                let outcome = match timeout {
                    Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
                    None => Ok(fut.await),
                };
                if outcome.is_err()
                    && let RuntimeRequest::Process(req) = &request
                {
                    self.process.abandon(req, ctx).await;
                }
                outcome
            }
            Err(e) => Ok(Err(e)),
        };

        let (status, exit_code, output, error) = match outcome {
            Err(limit) => {
                tracing::warn!(
                    run = %ctx.run_id,
                    step = step.step.ordinal,
                    timeout_secs = limit.as_secs(),
                    "Step timed out"
                );
                (
                    StepStatus::Timeout,
                    None,
                    CapturedOutput::default(),
                    Some(StepError::StepTimeout {
                        secs: limit.as_secs(),
                    }),
                )
            }
            Ok(Err(e)) => {
                tracing::error!(run = %ctx.run_id, step = step.step.ordinal, error = %e, "Step could not run");
                (
                    StepStatus::Failure,
                    None,
                    CapturedOutput::default(),
                    Some(StepError::Runtime {
                        reason: e.to_string(),
                    }),
                )
            }
            Ok(Ok(out)) => {
                let error = (!out.is_success()).then(|| StepError::StepFailure {
                    code: out.exit_code,
                    stderr: tail_lines(&out.stderr, STDERR_TAIL_LINES),
                });
                let status = if out.is_success() {
                    StepStatus::Success
                } else {
                    StepStatus::Failure
                };
                (
                    status,
                    Some(out.exit_code),
                    CapturedOutput {
                        stdout: out.stdout,
                        stderr: out.stderr,
                    },
                    error,
                )
            }
        };

        let result = StepResult {
            step: step.step.clone(),
            status,
            exit_code,
            output,
            error,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            run = %ctx.run_id,
            step = step.step.ordinal,
            status = %result.status,
            duration_ms = result.duration().num_milliseconds(),
            "Step completed"
        );
        result
    }
}
