//! Dispatcher
//!
//! Drains the trigger evaluator's queue, executing runs concurrently up to a
//! limit. Each definition gets its own workspace directory below the
//! dispatcher root.

use super::evaluator::{ScheduledRun, TriggerEvaluator};
use crate::executor::{CancelHandle, Executor};
use crate::infrastructure::Config;
use crate::pipeline::PipelineRun;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Executes queued runs
#[derive(Debug)]
pub struct Dispatcher {
    evaluator: Arc<TriggerEvaluator>,
    executor: Arc<Executor>,
    workspace_root: PathBuf,
    max_concurrent_runs: usize,
    running: Arc<Mutex<AHashMap<Uuid, CancelHandle>>>,
}

impl Dispatcher {
    /// Creates a dispatcher
    #[must_use]
    pub fn new(
        evaluator: Arc<TriggerEvaluator>,
        executor: Arc<Executor>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            evaluator,
            executor,
            workspace_root: workspace_root.into(),
            max_concurrent_runs: 1,
            running: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// Creates a dispatcher with the configured workspace root and
    /// concurrency limit
    #[must_use]
    pub fn from_config(
        evaluator: Arc<TriggerEvaluator>,
        executor: Arc<Executor>,
        config: &Config,
    ) -> Self {
        Self::new(evaluator, executor, config.workspace_root.clone())
            .with_max_concurrent_runs(config.max_concurrent_runs)
    }

    /// Limits how many runs execute at once (minimum 1)
    #[must_use]
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    /// Runs executed at once
    #[must_use]
    pub fn max_concurrent_runs(&self) -> usize {
        self.max_concurrent_runs
    }

    /// Workspace directory of `definition`
    #[must_use]
    pub fn workspace_for(&self, definition: &str) -> PathBuf {
        self.workspace_root.join(definition)
    }

    /// Requests cancellation of an executing run
    ///
    /// Returns false if the run is not executing.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.running.lock().get(&run_id) {
            Some(handle) => {
                tracing::info!(run = %run_id, "Cancellation requested");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Executes queued runs until nothing is pending or executing
    ///
    /// Returns the finished runs in completion order. Runs still waiting on
    /// a quiet period are waited for.
    pub async fn drain(&self) -> Vec<PipelineRun> {
        let mut tasks: JoinSet<Option<PipelineRun>> = JoinSet::new();
        let mut finished = Vec::new();

        loop {
            while tasks.len() < self.max_concurrent_runs {
                let Some(scheduled) = self.evaluator.dequeue() else {
                    break;
                };
                self.spawn(&mut tasks, scheduled);
            }

            let wait = if tasks.len() < self.max_concurrent_runs {
                self.evaluator.next_ready_in()
            } else {
                None
            };
            if tasks.is_empty() && wait.is_none() {
                break;
            }

            let timer = tokio::time::sleep(wait.unwrap_or(IDLE_WAIT));
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(Some(run)) => finished.push(run),
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "Run task failed"),
                },
                () = timer, if wait.is_some() => {}
                () = self.evaluator.notified() => {}
            }
        }

        finished
    }

    fn spawn(&self, tasks: &mut JoinSet<Option<PipelineRun>>, scheduled: ScheduledRun) {
        let ScheduledRun {
            run,
            definition,
            overrides,
        } = scheduled;
        let evaluator = Arc::clone(&self.evaluator);
        let executor = Arc::clone(&self.executor);
        let running = Arc::clone(&self.running);
        let workspace = self.workspace_for(&definition.name);
        let cancel = CancelHandle::new();
        running.lock().insert(run.id, cancel.clone());

        tasks.spawn(async move {
            let run_id = run.id;
            let name = definition.name.clone();
            let result = match prepare_workspace(&workspace).await {
                Ok(()) => {
                    let scope = executor.build_scope(&definition, &run, &workspace, &overrides);
                    executor
                        .execute(run, &definition, &scope, &workspace, &cancel)
                        .await
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };
            running.lock().remove(&run_id);

            match result {
                Ok(run) => {
                    evaluator.complete(run.clone());
                    Some(run)
                }
                Err(reason) => {
                    tracing::error!(definition = %name, run = %run_id, reason = %reason, "Run could not execute");
                    evaluator.abandon(&name, run_id);
                    None
                }
            }
        });
    }
}

async fn prepare_workspace(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{
        Invocation, ProcessOutput, ProcessRequest, ProcessRuntime, RemoteRequest, RemoteRuntime,
        RunContext, RuntimeError,
    };
    use crate::pipeline::{PipelineDefinition, RunStatus, Step, Trigger};
    use crate::scheduler::{DefinitionRegistry, VcsChangeEvent};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Records the highest number of overlapping executions per definition
    #[derive(Default)]
    struct CountingRuntime {
        active: Mutex<AHashMap<String, usize>>,
        peak: Mutex<AHashMap<String, usize>>,
    }

    #[async_trait]
    impl ProcessRuntime for CountingRuntime {
        async fn run(
            &self,
            request: &ProcessRequest,
            ctx: &RunContext,
        ) -> Result<ProcessOutput, RuntimeError> {
            {
                let mut active = self.active.lock();
                let count = active.entry(ctx.definition.clone()).or_default();
                *count += 1;
                let mut peak = self.peak.lock();
                let p = peak.entry(ctx.definition.clone()).or_default();
                *p = (*p).max(*count);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.active.lock().entry(ctx.definition.clone()).or_default() -= 1;
            let failed = matches!(&request.invocation, Invocation::Script { content } if content == "false");
            Ok(ProcessOutput {
                exit_code: i32::from(failed),
                ..ProcessOutput::default()
            })
        }
    }

    #[async_trait]
    impl RemoteRuntime for CountingRuntime {
        async fn run(
            &self,
            _request: &RemoteRequest,
            _ctx: &RunContext,
        ) -> Result<ProcessOutput, RuntimeError> {
            Ok(ProcessOutput::default())
        }
    }

    fn setup(
        root: &Path,
        max: usize,
    ) -> (Arc<CountingRuntime>, Arc<TriggerEvaluator>, Dispatcher) {
        let registry = Arc::new(DefinitionRegistry::new());
        for name in ["a", "b"] {
            registry
                .register(
                    PipelineDefinition::builder(name)
                        .step(Step::script("true"))
                        .trigger(Trigger::vcs())
                        .build_unchecked(),
                )
                .unwrap();
        }
        let runtime = Arc::new(CountingRuntime::default());
        let evaluator = Arc::new(TriggerEvaluator::new(registry));
        let executor = Arc::new(Executor::new(runtime.clone(), runtime.clone()));
        let dispatcher = Dispatcher::new(Arc::clone(&evaluator), executor, root)
            .with_max_concurrent_runs(max);
        (runtime, evaluator, dispatcher)
    }

    #[tokio::test]
    async fn test_drain_executes_all_runs() {
        let root = tempfile::tempdir().unwrap();
        let (_, evaluator, dispatcher) = setup(root.path(), 4);
        evaluator
            .on_external_event(VcsChangeEvent::new("a", "r1"))
            .unwrap();
        evaluator
            .on_external_event(VcsChangeEvent::new("b", "r1"))
            .unwrap();
        evaluator.enqueue_manual("a", BTreeMap::new()).unwrap();

        let runs = dispatcher.drain().await;
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status() == RunStatus::Succeeded));
        assert!(evaluator.is_idle());
        assert!(root.path().join("a").is_dir());

        let numbers: Vec<u64> = evaluator.history("a").iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_runs_of_one_definition_never_overlap() {
        let root = tempfile::tempdir().unwrap();
        let (runtime, evaluator, dispatcher) = setup(root.path(), 4);
        for _ in 0..3 {
            evaluator.enqueue_manual("a", BTreeMap::new()).unwrap();
            evaluator.enqueue_manual("b", BTreeMap::new()).unwrap();
        }

        let runs = dispatcher.drain().await;
        assert_eq!(runs.len(), 6);
        let peak = runtime.peak.lock();
        assert_eq!(peak.get("a"), Some(&1));
        assert_eq!(peak.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn test_drain_waits_for_quiet_period() {
        let root = tempfile::tempdir().unwrap();
        let registry = Arc::new(DefinitionRegistry::new());
        registry
            .register(
                PipelineDefinition::builder("q")
                    .step(Step::script("true"))
                    .trigger(Trigger::vcs().with_quiet_period(Duration::from_secs(1)))
                    .build_unchecked(),
            )
            .unwrap();
        let runtime = Arc::new(CountingRuntime::default());
        let evaluator = Arc::new(TriggerEvaluator::new(registry));
        let dispatcher = Dispatcher::new(
            Arc::clone(&evaluator),
            Arc::new(Executor::new(runtime.clone(), runtime)),
            root.path(),
        );

        evaluator
            .on_external_event(VcsChangeEvent::new("q", "r1"))
            .unwrap();
        evaluator
            .on_external_event(VcsChangeEvent::new("q", "r2"))
            .unwrap();
        let runs = dispatcher.drain().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].cause.revision(), Some("r2"));
    }

    #[tokio::test]
    async fn test_from_config_uses_workspace_root_and_limit() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            workspace_root: root.path().join("ws"),
            max_concurrent_runs: 3,
            ..Config::default()
        };
        let (runtime, evaluator, _) = setup(root.path(), 1);
        let dispatcher = Dispatcher::from_config(
            Arc::clone(&evaluator),
            Arc::new(Executor::new(runtime.clone(), runtime)),
            &config,
        );
        assert_eq!(dispatcher.max_concurrent_runs(), 3);
        assert_eq!(dispatcher.workspace_for("a"), root.path().join("ws").join("a"));

        evaluator.enqueue_manual("a", BTreeMap::new()).unwrap();
        let runs = dispatcher.drain().await;
        assert_eq!(runs.len(), 1);
        assert!(root.path().join("ws/a").is_dir());
    }

    #[test]
    fn test_cancel_unknown_run() {
        let root = tempfile::tempdir().unwrap();
        let (_, _, dispatcher) = setup(root.path(), 1);
        assert!(!dispatcher.cancel(Uuid::new_v4()));
    }
}
