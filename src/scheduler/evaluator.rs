//! Trigger evaluation and the per-definition run queue
//!
//! A change event enqueues at most one pending run per definition. Events
//! arriving while a change-triggered run is still pending are folded into
//! it: the run builds the latest revision and its quiet period is not
//! extended. Runs of one definition are dequeued one at a time in enqueue
//! order and numbered at dequeue.

use super::SchedulerError;
use super::registry::DefinitionRegistry;
use crate::infrastructure::Config;
use crate::pipeline::{PipelineDefinition, PipelineRun, RunCause};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

const HISTORY_LIMIT: usize = 100;

/// A change reported by the version-control source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsChangeEvent {
    /// Definition the change is relevant to
    pub definition: String,
    /// Revision identifier
    pub revision: String,
    /// Branch, when known
    #[serde(default)]
    pub branch: Option<String>,
}

impl VcsChangeEvent {
    /// Creates an event without branch information
    pub fn new(definition: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            revision: revision.into(),
            branch: None,
        }
    }

    /// Sets the branch
    #[must_use]
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Outcome of evaluating an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDecision {
    /// A new pending run was created
    Enqueued {
        /// Id of the new run
        run_id: Uuid,
    },
    /// The event was folded into an already pending run
    Coalesced {
        /// Id of the pending run
        run_id: Uuid,
    },
    /// No trigger of the definition matched the event
    Ignored,
}

/// A run handed out for execution
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    /// Pending run with its number assigned
    pub run: PipelineRun,
    /// Definition version captured at enqueue
    pub definition: Arc<PipelineDefinition>,
    /// Parameter overrides of a manual invocation
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug)]
struct QueueEntry {
    run: PipelineRun,
    definition: Arc<PipelineDefinition>,
    overrides: BTreeMap<String, String>,
    ready_at: Instant,
}

#[derive(Debug, Default)]
struct DefinitionQueue {
    pending: VecDeque<QueueEntry>,
    active: Option<Uuid>,
    last_number: u64,
    history: VecDeque<PipelineRun>,
}

impl DefinitionQueue {
    fn pending_change_mut(&mut self) -> Option<&mut QueueEntry> {
        self.pending
            .iter_mut()
            .find(|e| matches!(e.run.cause, RunCause::VcsChange { .. }))
    }
}

/// Decides which events enqueue runs and hands runs out in order
#[derive(Debug)]
pub struct TriggerEvaluator {
    registry: Arc<DefinitionRegistry>,
    queues: Mutex<AHashMap<String, DefinitionQueue>>,
    default_quiet_period: Duration,
    notify: Notify,
}

impl TriggerEvaluator {
    /// Creates an evaluator over `registry`
    #[must_use]
    pub fn new(registry: Arc<DefinitionRegistry>) -> Self {
        Self {
            registry,
            queues: Mutex::new(AHashMap::new()),
            default_quiet_period: Duration::ZERO,
            notify: Notify::new(),
        }
    }

    /// Creates an evaluator using the configured default quiet period
    #[must_use]
    pub fn from_config(registry: Arc<DefinitionRegistry>, config: &Config) -> Self {
        Self::new(registry).with_default_quiet_period(config.quiet_period())
    }

    /// Quiet period for triggers that declare none
    #[must_use]
    pub fn with_default_quiet_period(mut self, period: Duration) -> Self {
        self.default_quiet_period = period;
        self
    }

    /// Registry the evaluator reads definitions from
    #[must_use]
    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    /// Evaluates a change event
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownDefinition`] if the event names no
    /// registered definition.
    pub fn on_external_event(
        &self,
        event: VcsChangeEvent,
    ) -> Result<EnqueueDecision, SchedulerError> {
        let definition = self.registry.require(&event.definition)?;
        let Some(trigger) = definition
            .triggers
            .iter()
            .find(|t| t.matches_branch(event.branch.as_deref()))
        else {
            tracing::debug!(
                definition = %event.definition,
                revision = %event.revision,
                "No trigger matched change"
            );
            return Ok(EnqueueDecision::Ignored);
        };
        let quiet_period = trigger.quiet_period().unwrap_or(self.default_quiet_period);

        let mut queues = self.queues.lock();
        let queue = queues.entry(definition.name.clone()).or_default();

        if let Some(entry) = queue.pending_change_mut() {
            if let RunCause::VcsChange {
                revision,
                branch,
                coalesced,
            } = &mut entry.run.cause
            {
                *revision = event.revision.clone();
                *branch = event.branch.clone();
                *coalesced += 1;
            }
            let run_id = entry.run.id;
            tracing::info!(
                definition = %definition.name,
                run = %run_id,
                revision = %event.revision,
                "Change coalesced into pending run"
            );
            return Ok(EnqueueDecision::Coalesced { run_id });
        }

        let run = PipelineRun::new(
            definition.name.clone(),
            definition.version,
            RunCause::VcsChange {
                revision: event.revision.clone(),
                branch: event.branch,
                coalesced: 0,
            },
        );
        let run_id = run.id;
        queue.pending.push_back(QueueEntry {
            run,
            definition: Arc::clone(&definition),
            overrides: BTreeMap::new(),
            ready_at: Instant::now() + quiet_period,
        });
        drop(queues);

        tracing::info!(
            definition = %definition.name,
            run = %run_id,
            revision = %event.revision,
            quiet_period_ms = quiet_period.as_millis() as u64,
            "Run enqueued by change"
        );
        self.notify.notify_one();
        Ok(EnqueueDecision::Enqueued { run_id })
    }

    /// Enqueues a manual run; manual runs are never coalesced
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownDefinition`] if `definition` is not
    /// registered.
    pub fn enqueue_manual(
        &self,
        definition: &str,
        overrides: BTreeMap<String, String>,
    ) -> Result<Uuid, SchedulerError> {
        let definition = self.registry.require(definition)?;
        let run = PipelineRun::new(definition.name.clone(), definition.version, RunCause::Manual);
        let run_id = run.id;

        self.queues
            .lock()
            .entry(definition.name.clone())
            .or_default()
            .pending
            .push_back(QueueEntry {
                run,
                definition: Arc::clone(&definition),
                overrides,
                ready_at: Instant::now(),
            });

        tracing::info!(definition = %definition.name, run = %run_id, "Manual run enqueued");
        self.notify.notify_one();
        Ok(run_id)
    }

    /// Hands out the oldest ready run of a definition with no active run
    ///
    /// The returned run is numbered and its definition becomes active until
    /// [`TriggerEvaluator::complete`] is called.
    pub fn dequeue(&self) -> Option<ScheduledRun> {
        let now = Instant::now();
        let mut queues = self.queues.lock();

        let name = queues
            .iter()
            .filter(|(_, q)| q.active.is_none())
            .filter_map(|(name, q)| q.pending.front().map(|e| (name, e)))
            .filter(|(_, e)| e.ready_at <= now)
            .min_by_key(|(_, e)| e.run.queued_at)
            .map(|(name, _)| name.clone())?;

        let queue = queues.get_mut(&name)?;
        let mut entry = queue.pending.pop_front()?;
        queue.last_number += 1;
        entry.run.number = queue.last_number;
        queue.active = Some(entry.run.id);

        tracing::debug!(
            definition = %name,
            run = %entry.run.id,
            number = entry.run.number,
            "Run dequeued"
        );
        Some(ScheduledRun {
            run: entry.run,
            definition: entry.definition,
            overrides: entry.overrides,
        })
    }

    /// Time until the next queued run becomes ready, if any is waiting on
    /// its quiet period
    #[must_use]
    pub fn next_ready_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.queues
            .lock()
            .values()
            .filter(|q| q.active.is_none())
            .filter_map(|q| q.pending.front())
            .map(|e| e.ready_at.saturating_duration_since(now))
            .min()
    }

    /// Records a finished run and releases its definition
    pub fn complete(&self, run: PipelineRun) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(run.definition.clone()).or_default();
        if queue.active == Some(run.id) {
            queue.active = None;
        }
        tracing::debug!(definition = %run.definition, run = %run.id, status = %run.status(), "Run recorded");
        queue.history.push_back(run);
        while queue.history.len() > HISTORY_LIMIT {
            queue.history.pop_front();
        }
        drop(queues);
        self.notify.notify_one();
    }

    /// Releases a definition whose active run produced no record
    pub fn abandon(&self, definition: &str, run_id: Uuid) {
        if let Some(queue) = self.queues.lock().get_mut(definition)
            && queue.active == Some(run_id)
        {
            tracing::warn!(definition = %definition, run = %run_id, "Run abandoned");
            queue.active = None;
        }
        self.notify.notify_one();
    }

    /// Completed runs of `definition`, oldest first
    #[must_use]
    pub fn history(&self, definition: &str) -> Vec<PipelineRun> {
        self.queues
            .lock()
            .get(definition)
            .map(|q| q.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of pending runs of `definition`
    #[must_use]
    pub fn pending_count(&self, definition: &str) -> usize {
        self.queues
            .lock()
            .get(definition)
            .map_or(0, |q| q.pending.len())
    }

    /// Returns true if a run of `definition` is executing
    #[must_use]
    pub fn is_active(&self, definition: &str) -> bool {
        self.queues
            .lock()
            .get(definition)
            .is_some_and(|q| q.active.is_some())
    }

    /// Returns true if nothing is pending or executing
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queues
            .lock()
            .values()
            .all(|q| q.pending.is_empty() && q.active.is_none())
    }

    /// Resolves once the queue changed
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RunStatus, Step, Trigger};
    use pretty_assertions::assert_eq;

    fn evaluator_with(trigger: Trigger) -> TriggerEvaluator {
        let registry = Arc::new(DefinitionRegistry::new());
        registry
            .register(
                PipelineDefinition::builder("app")
                    .step(Step::script("make"))
                    .trigger(trigger)
                    .build_unchecked(),
            )
            .unwrap();
        TriggerEvaluator::new(registry)
    }

    fn evaluator() -> TriggerEvaluator {
        evaluator_with(Trigger::vcs())
    }

    fn finish(evaluator: &TriggerEvaluator, mut scheduled: ScheduledRun) {
        scheduled.run.transition(RunStatus::Running).unwrap();
        scheduled.run.transition(RunStatus::Succeeded).unwrap();
        evaluator.complete(scheduled.run);
    }

    #[test]
    fn test_event_enqueues_one_pending_run() {
        let evaluator = evaluator();
        let first = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r1"))
            .unwrap();
        let second = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r2"))
            .unwrap();

        let EnqueueDecision::Enqueued { run_id } = first else {
            panic!("expected enqueue, got {first:?}");
        };
        assert_eq!(second, EnqueueDecision::Coalesced { run_id });
        assert_eq!(evaluator.pending_count("app"), 1);

        let scheduled = evaluator.dequeue().unwrap();
        assert_eq!(scheduled.run.cause.revision(), Some("r2"));
        assert!(matches!(
            scheduled.run.cause,
            RunCause::VcsChange { coalesced: 1, .. }
        ));
    }

    #[test]
    fn test_event_while_running_enqueues_follow_up() {
        let evaluator = evaluator();
        evaluator
            .on_external_event(VcsChangeEvent::new("app", "r1"))
            .unwrap();
        let running = evaluator.dequeue().unwrap();
        assert!(evaluator.is_active("app"));

        let decision = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r2"))
            .unwrap();
        assert!(matches!(decision, EnqueueDecision::Enqueued { .. }));
        let decision = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r3"))
            .unwrap();
        assert!(matches!(decision, EnqueueDecision::Coalesced { .. }));

        // Serialized per definition
        assert!(evaluator.dequeue().is_none());
        finish(&evaluator, running);

        let next = evaluator.dequeue().unwrap();
        assert_eq!(next.run.number, 2);
        assert_eq!(next.run.cause.revision(), Some("r3"));
    }

    #[test]
    fn test_run_numbers_are_monotonic() {
        let evaluator = evaluator();
        for expected in 1..=3 {
            evaluator.enqueue_manual("app", BTreeMap::new()).unwrap();
            let scheduled = evaluator.dequeue().unwrap();
            assert_eq!(scheduled.run.number, expected);
            finish(&evaluator, scheduled);
        }
        let numbers: Vec<u64> = evaluator.history("app").iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(evaluator.is_idle());
    }

    #[test]
    fn test_manual_runs_are_not_coalesced() {
        let evaluator = evaluator();
        let a = evaluator.enqueue_manual("app", BTreeMap::new()).unwrap();
        let b = evaluator.enqueue_manual("app", BTreeMap::new()).unwrap();
        assert_ne!(a, b);
        assert_eq!(evaluator.pending_count("app"), 2);

        let decision = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r1"))
            .unwrap();
        assert!(matches!(decision, EnqueueDecision::Enqueued { .. }));
        assert_eq!(evaluator.pending_count("app"), 3);
    }

    #[test]
    fn test_enqueue_order_preserved() {
        let evaluator = evaluator();
        let mut overrides = BTreeMap::new();
        overrides.insert("ENV".to_string(), "prod".to_string());
        let manual = evaluator.enqueue_manual("app", overrides).unwrap();
        evaluator
            .on_external_event(VcsChangeEvent::new("app", "r1"))
            .unwrap();

        let first = evaluator.dequeue().unwrap();
        assert_eq!(first.run.id, manual);
        assert_eq!(first.overrides["ENV"], "prod");
        finish(&evaluator, first);
        let second = evaluator.dequeue().unwrap();
        assert_eq!(second.run.cause.revision(), Some("r1"));
    }

    #[test]
    fn test_branch_filter_ignores_other_branches() {
        let evaluator = evaluator_with(Trigger::vcs_on_branches(vec!["main".to_string()]));
        let ignored = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r1").on_branch("feature/x"))
            .unwrap();
        assert_eq!(ignored, EnqueueDecision::Ignored);
        let enqueued = evaluator
            .on_external_event(VcsChangeEvent::new("app", "r2").on_branch("refs/heads/main"))
            .unwrap();
        assert!(matches!(enqueued, EnqueueDecision::Enqueued { .. }));
    }

    #[test]
    fn test_definition_without_trigger_ignores_events() {
        let registry = Arc::new(DefinitionRegistry::new());
        registry
            .register(
                PipelineDefinition::builder("manual-only")
                    .step(Step::script("make"))
                    .build_unchecked(),
            )
            .unwrap();
        let evaluator = TriggerEvaluator::new(registry);
        assert_eq!(
            evaluator
                .on_external_event(VcsChangeEvent::new("manual-only", "r1"))
                .unwrap(),
            EnqueueDecision::Ignored
        );
    }

    #[test]
    fn test_unknown_definition() {
        let evaluator = evaluator();
        assert!(matches!(
            evaluator.on_external_event(VcsChangeEvent::new("nope", "r1")),
            Err(SchedulerError::UnknownDefinition { .. })
        ));
    }

    #[test]
    fn test_quiet_period_delays_dequeue() {
        let evaluator = evaluator_with(Trigger::vcs().with_quiet_period(Duration::from_secs(60)));
        evaluator
            .on_external_event(VcsChangeEvent::new("app", "r1"))
            .unwrap();
        assert!(evaluator.dequeue().is_none());
        let wait = evaluator.next_ready_in().unwrap();
        assert!(wait > Duration::from_secs(50));

        // Coalescing does not extend the quiet period
        evaluator
            .on_external_event(VcsChangeEvent::new("app", "r2"))
            .unwrap();
        assert!(evaluator.next_ready_in().unwrap() <= wait);
    }

    #[test]
    fn test_configured_quiet_period_applies_to_plain_triggers() {
        let registry = Arc::new(DefinitionRegistry::new());
        for (name, trigger) in [
            ("plain", Trigger::vcs()),
            ("own", Trigger::vcs().with_quiet_period(Duration::ZERO)),
        ] {
            registry
                .register(
                    PipelineDefinition::builder(name)
                        .step(Step::script("make"))
                        .trigger(trigger)
                        .build_unchecked(),
                )
                .unwrap();
        }
        let config = Config {
            quiet_period_secs: 120,
            ..Config::default()
        };
        let evaluator = TriggerEvaluator::from_config(registry, &config);

        evaluator
            .on_external_event(VcsChangeEvent::new("plain", "r1"))
            .unwrap();
        assert!(evaluator.dequeue().is_none());
        assert!(evaluator.next_ready_in().unwrap() > Duration::from_secs(100));

        evaluator
            .on_external_event(VcsChangeEvent::new("own", "r1"))
            .unwrap();
        assert_eq!(evaluator.dequeue().unwrap().run.definition, "own");
    }

    #[test]
    fn test_abandon_releases_definition() {
        let evaluator = evaluator();
        evaluator.enqueue_manual("app", BTreeMap::new()).unwrap();
        evaluator.enqueue_manual("app", BTreeMap::new()).unwrap();
        let scheduled = evaluator.dequeue().unwrap();
        assert!(evaluator.dequeue().is_none());
        evaluator.abandon("app", scheduled.run.id);
        assert!(evaluator.dequeue().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_events_enqueue_once() {
        let evaluator = Arc::new(evaluator());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let evaluator = Arc::clone(&evaluator);
            tasks.push(tokio::spawn(async move {
                evaluator
                    .on_external_event(VcsChangeEvent::new("app", format!("r{i}")))
                    .unwrap()
            }));
        }
        let decisions: Vec<EnqueueDecision> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let enqueued = decisions
            .iter()
            .filter(|d| matches!(d, EnqueueDecision::Enqueued { .. }))
            .count();
        assert_eq!(enqueued, 1);
        assert_eq!(evaluator.pending_count("app"), 1);
    }
}
