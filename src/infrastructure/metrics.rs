//! Metrics collection
//!
//! Records per-run and per-step durations for definitions that declare the
//! `perfmon` feature.

use crate::pipeline::{PipelineRun, RunStatus, StepStatus};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Duration of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMetrics {
    /// Step label
    pub label: String,
    /// Outcome
    pub status: StepStatus,
    /// Wall-clock duration
    pub duration: Duration,
}

/// Metrics for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetrics {
    /// Definition name
    pub definition: String,

    /// Run number
    pub number: u64,

    /// Terminal status
    pub status: RunStatus,

    /// Run duration
    pub duration: Duration,

    /// Per-step durations in ordinal order
    pub steps: Vec<StepMetrics>,
}

impl RunMetrics {
    /// Builds metrics from a finished run
    #[must_use]
    pub fn from_run(run: &PipelineRun) -> Self {
        let duration = match (run.started_at, run.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        Self {
            definition: run.definition.clone(),
            number: run.number,
            status: run.status(),
            duration,
            steps: run
                .results
                .iter()
                .map(|r| StepMetrics {
                    label: r.step.label.clone(),
                    status: r.status,
                    duration: r.duration().to_std().unwrap_or_default(),
                })
                .collect(),
        }
    }

    /// Number of steps that failed or timed out
    #[must_use]
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_failure()).count()
    }
}

/// Thread-safe store of run metrics, keyed by definition
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<AHashMap<String, Vec<RunMetrics>>>>,
}

impl MetricsCollector {
    /// Creates a new metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records metrics for a run
    pub fn record(&self, metrics: RunMetrics) {
        tracing::debug!(
            definition = %metrics.definition,
            number = metrics.number,
            duration_ms = metrics.duration.as_millis() as u64,
            "Recording run metrics"
        );
        self.metrics
            .write()
            .entry(metrics.definition.clone())
            .or_default()
            .push(metrics);
    }

    /// Most recent metrics for a definition
    #[must_use]
    pub fn latest(&self, definition: &str) -> Option<RunMetrics> {
        self.metrics
            .read()
            .get(definition)
            .and_then(|runs| runs.last().cloned())
    }

    /// All recorded metrics for a definition, oldest first
    #[must_use]
    pub fn for_definition(&self, definition: &str) -> Vec<RunMetrics> {
        self.metrics
            .read()
            .get(definition)
            .cloned()
            .unwrap_or_default()
    }

    /// Average step duration by label across recorded runs of `definition`
    #[must_use]
    pub fn average_step_durations(&self, definition: &str) -> Vec<(String, Duration)> {
        let guard = self.metrics.read();
        let Some(runs) = guard.get(definition) else {
            return Vec::new();
        };
        let mut totals: Vec<(String, Duration, u32)> = Vec::new();
        for step in runs.iter().flat_map(|r| &r.steps) {
            if step.status.is_skipped() {
                continue;
            }
            match totals.iter_mut().find(|(label, _, _)| *label == step.label) {
                Some((_, total, count)) => {
                    *total += step.duration;
                    *count += 1;
                }
                None => totals.push((step.label.clone(), step.duration, 1)),
            }
        }
        totals
            .into_iter()
            .map(|(label, total, count)| (label, total / count))
            .collect()
    }
}
