//! Pipeline runs and step results
//!
//! A [`PipelineRun`] is one execution instance of a definition. It is owned
//! by the executor while active and immutable once terminal.

#![allow(clippy::must_use_candidate)]

use super::errors::StepError;
use super::steps::StepRef;
use super::types::{RunStatus, StepStatus};
use crate::artifacts::ArtifactManifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Rejected run state change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current status
    pub from: RunStatus,
    /// Requested status
    pub to: RunStatus,
}

/// What caused a run to be enqueued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCause {
    /// A VCS change matched a trigger
    VcsChange {
        /// Latest revision folded into this run
        revision: String,
        /// Branch of the change
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        /// Number of change events coalesced into this run
        coalesced: usize,
    },
    /// Manually requested
    Manual,
}

impl RunCause {
    /// Revision the run builds, if known
    pub fn revision(&self) -> Option<&str> {
        match self {
            Self::VcsChange { revision, .. } => Some(revision),
            Self::Manual => None,
        }
    }
}

/// Captured output of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CapturedOutput {
    /// Standard output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Standard error
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// Result of one step within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step this result belongs to
    pub step: StepRef,
    /// Outcome
    pub status: StepStatus,
    /// Process exit code, when the step ran to completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured output
    #[serde(default)]
    pub output: CapturedOutput,
    /// Failure descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// When the step started (or was skipped)
    pub started_at: DateTime<Utc>,
    /// When the step finished (or was skipped)
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    /// Builds a result for a step that was not executed
    pub fn skipped(step: StepRef) -> Self {
        let now = Utc::now();
        Self {
            step,
            status: StepStatus::Skipped,
            exit_code: None,
            output: CapturedOutput::default(),
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Wall-clock duration of the step
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.status)
    }
}

/// One execution instance of a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id
    pub id: Uuid,
    /// Definition name
    pub definition: String,
    /// Definition version the run executes
    pub definition_version: u32,
    /// Run number, assigned on dequeue; 0 while queued
    pub number: u64,
    /// Current status
    status: RunStatus,
    /// Why the run exists
    pub cause: RunCause,
    /// Results in ordinal order
    pub results: Vec<StepResult>,
    /// Collected artifacts, recorded before the run turns terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactManifest>,
    /// Run-level error description (resolution or cleanup failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cancellation was requested
    #[serde(default)]
    pub cancelled: bool,
    /// Enqueue time
    pub queued_at: DateTime<Utc>,
    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates a pending run
    pub fn new(definition: impl Into<String>, definition_version: u32, cause: RunCause) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition: definition.into(),
            definition_version,
            number: 0,
            status: RunStatus::Pending,
            cause,
            results: Vec::new(),
            artifacts: None,
            error: None,
            cancelled: false,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Current status
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves the run to `next`
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the state machine forbids the move;
    /// a terminal run never changes again.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(
            run = %self.id,
            definition = %self.definition,
            number = self.number,
            from = %self.status,
            to = %next,
            "Run transition"
        );
        match next {
            RunStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Returns true if the run ever entered `Running`
    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Result recorded for the step at `ordinal`
    pub fn result_for(&self, ordinal: usize) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step.ordinal == ordinal)
    }
}

impl fmt::Display for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}: {}", self.definition, self.number, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> PipelineRun {
        PipelineRun::new("build", 1, RunCause::Manual)
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = run();
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.number, 0);
        assert!(!run.has_started());
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut run = run();
        run.transition(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition(RunStatus::Failed).unwrap();
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut run = run();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();
        let err = run.transition(RunStatus::Running).unwrap_err();
        assert_eq!(err.from, RunStatus::Failed);
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.transition(RunStatus::Error).is_err());
    }

    #[test]
    fn test_pending_can_error_without_starting() {
        let mut run = run();
        run.transition(RunStatus::Error).unwrap();
        assert!(!run.has_started());
    }

    #[test]
    fn test_cause_revision() {
        let cause = RunCause::VcsChange {
            revision: "abc".to_string(),
            branch: None,
            coalesced: 1,
        };
        assert_eq!(cause.revision(), Some("abc"));
        assert_eq!(RunCause::Manual.revision(), None);
    }

    #[test]
    fn test_run_serializes_status() {
        let json = serde_json::to_value(run()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["cause"]["type"], "manual");
    }
}
