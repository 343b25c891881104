//! Run state machine
//!
//! The [`Executor`] drives one [`PipelineRun`] from `Pending` to a terminal
//! status:
//!
//! 1. Every step is prepared against the run scope. A resolution failure
//!    moves the run straight to `Error`; nothing executes.
//! 2. Steps execute strictly in ordinal order. After the first failing
//!    `Normal` step, remaining `Normal` steps are skipped while `Always`
//!    steps still run. Cancellation is observed between steps and behaves
//!    the same way.
//! 3. The terminal status is `Error` if an `Always` step failed, `Failed` if
//!    a `Normal` step failed or the run was cancelled, `Succeeded` otherwise.
//! 4. Artifacts are collected from the workspace and handed to the
//!    configured store. Neither can change the terminal status.

use super::params::{ParameterScope, ResolveError};
use super::step::{ResolvedStep, StepRunner};
use super::traits::{ProcessRuntime, RemoteRuntime, RunContext};
use crate::artifacts::{ArtifactCollector, ArtifactManifest, ArtifactStore};
use crate::infrastructure::metrics::{MetricsCollector, RunMetrics};
use crate::pipeline::{
    ExecutionMode, Feature, InvalidTransition, PipelineDefinition, PipelineRun, RunStatus,
    StepResult,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Configuration for [`Executor`]
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Timeout for steps that declare none
    pub default_step_timeout: Option<Duration>,

    /// Expose the process environment as `env.*` parameters
    pub inherit_env: bool,
}

/// Cooperative cancellation flag shared with a running execution
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Creates an unset handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; takes effect before the next step
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes pipeline runs
#[derive(Clone)]
pub struct Executor {
    runner: StepRunner,
    collector: ArtifactCollector,
    store: Option<Arc<dyn ArtifactStore>>,
    metrics: MetricsCollector,
    config: ExecutorConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("runner", &self.runner)
            .field("has_store", &self.store.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor over the given runtimes
    #[must_use]
    pub fn new(process: Arc<dyn ProcessRuntime>, remote: Arc<dyn RemoteRuntime>) -> Self {
        Self {
            runner: StepRunner::new(process, remote),
            collector: ArtifactCollector::new(),
            store: None,
            metrics: MetricsCollector::new(),
            config: ExecutorConfig::default(),
        }
    }

    /// Sets the executor configuration
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.runner = self
            .runner
            .with_default_timeout(config.default_step_timeout);
        self.config = config;
        self
    }

    /// Sets the store that receives collected artifacts
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares a metrics collector
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics recorded for `perfmon` definitions
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Builds the parameter scope of `run`
    ///
    /// Build parameters are the definition's, then `overrides`. Computed
    /// values describe the run itself.
    #[must_use]
    pub fn build_scope(
        &self,
        definition: &PipelineDefinition,
        run: &PipelineRun,
        workspace: &Path,
        overrides: &BTreeMap<String, String>,
    ) -> ParameterScope {
        let mut scope = if self.config.inherit_env {
            ParameterScope::from_process_env()
        } else {
            ParameterScope::new()
        };
        scope.extend_build(definition.parameters.clone());
        scope.extend_build(overrides.clone());

        let revision = run.cause.revision().unwrap_or_default().to_string();
        scope
            .with_computed("build.number", run.number.to_string())
            .with_computed("build.id", run.id.to_string())
            .with_computed("build.vcs.number", revision.clone())
            .with_computed("build.vcs.number.1", revision)
            .with_computed(
                "system.build.checkoutDir",
                workspace.to_string_lossy().into_owned(),
            )
            .with_computed("definition.name", definition.name.clone())
    }

    /// Resolves every step without executing anything
    ///
    /// # Errors
    ///
    /// Returns the first [`ResolveError`] in ordinal order.
    pub fn plan(
        &self,
        definition: &PipelineDefinition,
        scope: &ParameterScope,
    ) -> Result<Vec<ResolvedStep>, ResolveError> {
        definition
            .ordered_steps()
            .map(|(ordinal, step)| step.prepare(ordinal, scope))
            .collect()
    }

    /// Executes `run` to a terminal status
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `run` is not `Pending`.
    pub async fn execute(
        &self,
        mut run: PipelineRun,
        definition: &PipelineDefinition,
        scope: &ParameterScope,
        workspace: &Path,
        cancel: &CancelHandle,
    ) -> Result<PipelineRun, InvalidTransition> {
        if run.status() != RunStatus::Pending {
            return Err(InvalidTransition {
                from: run.status(),
                to: RunStatus::Running,
            });
        }

        let steps = match self.plan(definition, scope) {
            Ok(steps) => steps,
            Err(e) => {
                tracing::error!(
                    run = %run.id,
                    definition = %run.definition,
                    error = %e,
                    "Parameter resolution failed"
                );
                run.error = Some(e.to_string());
                run.transition(RunStatus::Error)?;
                return Ok(run);
            }
        };

        let ctx = RunContext {
            run_id: run.id,
            definition: definition.name.clone(),
            number: run.number,
            workspace: workspace.to_path_buf(),
            features: definition.features.clone(),
        };

        run.transition(RunStatus::Running)?;
        tracing::info!(
            run = %run.id,
            definition = %run.definition,
            number = run.number,
            steps = steps.len(),
            "Run started"
        );

        let mut halted = false;
        let mut failed = false;
        let mut cleanup_failure: Option<String> = None;

        for step in &steps {
            if cancel.is_cancelled() && !run.cancelled {
                tracing::warn!(run = %run.id, "Run cancelled");
                run.cancelled = true;
            }

            if step.mode == ExecutionMode::Normal && (halted || run.cancelled) {
                tracing::info!(
                    run = %run.id,
                    step = step.step.ordinal,
                    label = %step.step.label,
                    "Skipping step"
                );
                run.results.push(StepResult::skipped(step.step.clone()));
                continue;
            }

            let result = self.runner.execute(step, &ctx).await;
            if result.status.is_failure() {
                match step.mode {
                    ExecutionMode::Normal => {
                        halted = true;
                        failed = true;
                    }
                    ExecutionMode::Always => {
                        if cleanup_failure.is_none() {
                            cleanup_failure = Some(format!("Cleanup step {} failed", step.step));
                        }
                    }
                }
            }
            run.results.push(result);
        }

        let terminal = if cleanup_failure.is_some() {
            RunStatus::Error
        } else if failed || run.cancelled {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        if let Some(message) = cleanup_failure {
            run.error = Some(message);
        }
        // Everything recorded on the run happens before it turns terminal.
        run.artifacts = self.collect_artifacts(&run, definition, workspace).await;
        run.transition(terminal)?;
        tracing::info!(
            run = %run.id,
            definition = %run.definition,
            number = run.number,
            status = %terminal,
            cancelled = run.cancelled,
            "Run finished"
        );

        self.store_artifacts(&run, workspace).await;

        if definition.has_feature(&Feature::Perfmon) {
            self.metrics.record(RunMetrics::from_run(&run));
        }

        Ok(run)
    }

    async fn collect_artifacts(
        &self,
        run: &PipelineRun,
        definition: &PipelineDefinition,
        workspace: &Path,
    ) -> Option<ArtifactManifest> {
        if definition.artifact_rules.is_empty() {
            return None;
        }

        let collector = self.collector;
        let root = workspace.to_path_buf();
        let rules = definition.artifact_rules.clone();
        let collected =
            tokio::task::spawn_blocking(move || collector.collect(&root, &rules)).await;

        match collected {
            Ok(Ok(manifest)) => {
                tracing::info!(
                    run = %run.id,
                    count = manifest.len(),
                    bytes = manifest.total_size(),
                    "Artifacts collected"
                );
                Some(manifest)
            }
            Ok(Err(e)) => {
                tracing::warn!(run = %run.id, error = %e, "Artifact collection failed");
                None
            }
            Err(e) => {
                tracing::warn!(run = %run.id, error = %e, "Artifact collection aborted");
                None
            }
        }
    }

    async fn store_artifacts(&self, run: &PipelineRun, workspace: &Path) {
        if let Some(store) = &self.store
            && let Some(manifest) = run.artifacts.as_ref().filter(|m| !m.is_empty())
            && let Err(e) = store.store(run, workspace, manifest).await
        {
            tracing::warn!(run = %run.id, error = %e, "Artifact store failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::traits::{
        Invocation, ProcessOutput, ProcessRequest, RemoteRequest, RuntimeError,
    };
    use crate::pipeline::{ArtifactRule, RunCause, Step, StepStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Scripts exit with 1 when they start with `fail`, hang on `hang`,
    /// cancel the run on `cancel`.
    #[derive(Default)]
    struct ScriptedRuntime {
        executed: Mutex<Vec<String>>,
        cancel: CancelHandle,
    }

    #[async_trait]
    impl ProcessRuntime for ScriptedRuntime {
        async fn run(
            &self,
            request: &ProcessRequest,
            _ctx: &RunContext,
        ) -> Result<ProcessOutput, RuntimeError> {
            let Invocation::Script { content } = &request.invocation else {
                return Ok(ProcessOutput::default());
            };
            self.executed.lock().push(content.clone());
            if content.starts_with("hang") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if content.starts_with("cancel") {
                self.cancel.cancel();
            }
            Ok(ProcessOutput {
                exit_code: i32::from(content.starts_with("fail")),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[async_trait]
    impl RemoteRuntime for ScriptedRuntime {
        async fn run(
            &self,
            request: &RemoteRequest,
            _ctx: &RunContext,
        ) -> Result<ProcessOutput, RuntimeError> {
            self.executed.lock().push(request.commands.clone());
            Ok(ProcessOutput::default())
        }
    }

    fn setup() -> (Arc<ScriptedRuntime>, Executor) {
        let runtime = Arc::new(ScriptedRuntime::default());
        let executor = Executor::new(runtime.clone(), runtime.clone());
        (runtime, executor)
    }

    async fn run_definition(
        executor: &Executor,
        definition: &PipelineDefinition,
        cancel: &CancelHandle,
    ) -> PipelineRun {
        let workspace = std::env::temp_dir();
        let mut run = PipelineRun::new(&definition.name, definition.version, RunCause::Manual);
        run.number = 1;
        let scope = executor.build_scope(definition, &run, &workspace, &BTreeMap::new());
        executor
            .execute(run, definition, &scope, &workspace, cancel)
            .await
            .unwrap()
    }

    fn statuses(run: &PipelineRun) -> Vec<StepStatus> {
        run.results.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let (runtime, executor) = setup();
        let definition = PipelineDefinition::builder("ok")
            .step(Step::script("echo one"))
            .step(Step::script("echo two"))
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &CancelHandle::new()).await;
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(statuses(&run), vec![StepStatus::Success, StepStatus::Success]);
        assert_eq!(*runtime.executed.lock(), vec!["echo one", "echo two"]);
    }

    #[tokio::test]
    async fn test_failure_skips_normal_and_runs_always() {
        let (runtime, executor) = setup();
        let definition = PipelineDefinition::builder("trivy")
            .step(Step::script("fail build").with_name("build"))
            .step(Step::script("push").with_name("push"))
            .step(Step::script("cleanup").with_name("cleanup").always())
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &CancelHandle::new()).await;
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            statuses(&run),
            vec![StepStatus::Failure, StepStatus::Skipped, StepStatus::Success]
        );
        assert_eq!(*runtime.executed.lock(), vec!["fail build", "cleanup"]);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_always_failure_is_error() {
        let (_, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .step(Step::script("build"))
            .step(Step::script("fail cleanup").always())
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &CancelHandle::new()).await;
        assert_eq!(run.status(), RunStatus::Error);
        assert!(run.error.as_deref().unwrap().contains("Cleanup step #1"));
    }

    #[tokio::test]
    async fn test_resolution_failure_never_runs() {
        let (runtime, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .step(Step::script("echo ok"))
            .step(Step::script("docker push app:%MISSING%"))
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &CancelHandle::new()).await;
        assert_eq!(run.status(), RunStatus::Error);
        assert!(!run.has_started());
        assert!(run.results.is_empty());
        assert!(runtime.executed.lock().is_empty());
        assert!(run.error.as_deref().unwrap().contains("MISSING"));
    }

    #[tokio::test]
    async fn test_cyclic_parameter_is_error() {
        let (_, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .parameter("A", "%B%")
            .parameter("B", "%A%")
            .step(Step::script("echo %A%"))
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &CancelHandle::new()).await;
        assert_eq!(run.status(), RunStatus::Error);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure_and_cleanup_runs() {
        let (runtime, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .step(Step::script("hang").with_timeout(Duration::from_secs(1)))
            .step(Step::script("next"))
            .step(Step::script("cleanup").always())
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &CancelHandle::new()).await;
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            statuses(&run),
            vec![StepStatus::Timeout, StepStatus::Skipped, StepStatus::Success]
        );
        assert_eq!(*runtime.executed.lock(), vec!["hang", "cleanup"]);
    }

    #[tokio::test]
    async fn test_cancellation_runs_always_steps() {
        let (runtime, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .step(Step::script("cancel now"))
            .step(Step::script("deploy"))
            .step(Step::script("cleanup").always())
            .build()
            .unwrap();

        let run = run_definition(&executor, &definition, &runtime.cancel).await;
        assert!(run.cancelled);
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            statuses(&run),
            vec![StepStatus::Success, StepStatus::Skipped, StepStatus::Success]
        );
    }

    #[tokio::test]
    async fn test_computed_parameters() {
        let (runtime, executor) = setup();
        let definition = PipelineDefinition::builder("images")
            .parameter("TAG", "%build.number%-%build.vcs.number%")
            .step(Step::script("echo %definition.name%:%TAG%"))
            .build()
            .unwrap();

        let workspace = std::env::temp_dir();
        let mut run = PipelineRun::new(
            "images",
            1,
            RunCause::VcsChange {
                revision: "abc123".to_string(),
                branch: None,
                coalesced: 0,
            },
        );
        run.number = 42;
        let scope = executor.build_scope(&definition, &run, &workspace, &BTreeMap::new());
        let run = executor
            .execute(run, &definition, &scope, &workspace, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(*runtime.executed.lock(), vec!["echo images:42-abc123"]);
    }

    #[tokio::test]
    async fn test_overrides_take_precedence_over_declared_parameters() {
        let (_, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .parameter("ENV", "dev")
            .step(Step::script("deploy %ENV%"))
            .build()
            .unwrap();
        let run = PipelineRun::new("p", 1, RunCause::Manual);
        let mut overrides = BTreeMap::new();
        overrides.insert("ENV".to_string(), "prod".to_string());

        let scope = executor.build_scope(&definition, &run, Path::new("/ws"), &overrides);
        let plan = executor.plan(&definition, &scope).unwrap();
        assert_eq!(plan[0].kind, crate::pipeline::StepKind::script("deploy prod"));
    }

    #[tokio::test]
    async fn test_execute_rejects_non_pending_run() {
        let (_, executor) = setup();
        let definition = PipelineDefinition::builder("p")
            .step(Step::script("x"))
            .build()
            .unwrap();
        let mut run = PipelineRun::new("p", 1, RunCause::Manual);
        run.transition(RunStatus::Running).unwrap();
        let result = executor
            .execute(
                run,
                &definition,
                &ParameterScope::new(),
                Path::new("/ws"),
                &CancelHandle::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_artifacts_collected_on_failure() {
        let (_, executor) = setup();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("trivy-results.json"), "{}").unwrap();
        let definition = PipelineDefinition::builder("scan")
            .step(Step::script("fail scan"))
            .artifact_rule(ArtifactRule::new("trivy-results.json"))
            .build()
            .unwrap();

        let run = PipelineRun::new("scan", 1, RunCause::Manual);
        let scope = executor.build_scope(&definition, &run, workspace.path(), &BTreeMap::new());
        let run = executor
            .execute(run, &definition, &scope, workspace.path(), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        let manifest = run.artifacts.unwrap();
        assert!(manifest.get("trivy-results.json").is_some());
    }

    /// Records what the store observed about each run it received
    #[derive(Default)]
    struct ObservingStore {
        seen: Mutex<Vec<(RunStatus, Option<ArtifactManifest>)>>,
    }

    #[async_trait]
    impl ArtifactStore for ObservingStore {
        async fn store(
            &self,
            run: &PipelineRun,
            _workspace: &Path,
            _manifest: &ArtifactManifest,
        ) -> Result<(), crate::artifacts::StoreError> {
            self.seen.lock().push((run.status(), run.artifacts.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_terminal_run_already_carries_its_artifacts() {
        let (runtime, _) = setup();
        let store = Arc::new(ObservingStore::default());
        let executor = Executor::new(runtime.clone(), runtime).with_store(store.clone());
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("report.txt"), "ok").unwrap();
        let definition = PipelineDefinition::builder("report")
            .step(Step::script("build"))
            .artifact_rule(ArtifactRule::new("report.txt"))
            .build()
            .unwrap();

        let run = PipelineRun::new("report", 1, RunCause::Manual);
        let scope = executor.build_scope(&definition, &run, workspace.path(), &BTreeMap::new());
        let run = executor
            .execute(run, &definition, &scope, workspace.path(), &CancelHandle::new())
            .await
            .unwrap();

        let seen = store.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, RunStatus::Succeeded);
        assert_eq!(seen[0].1, run.artifacts);
        assert_eq!(run.artifacts.as_ref().map(ArtifactManifest::len), Some(1));
    }

    #[tokio::test]
    async fn test_perfmon_records_metrics() {
        let (_, executor) = setup();
        let definition = PipelineDefinition::builder("perf")
            .step(Step::script("build"))
            .feature(Feature::Perfmon)
            .build()
            .unwrap();

        run_definition(&executor, &definition, &CancelHandle::new()).await;
        let metrics = executor.metrics().latest("perf").unwrap();
        assert_eq!(metrics.status, RunStatus::Succeeded);
        assert_eq!(metrics.steps.len(), 1);
    }
}
