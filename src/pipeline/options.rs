//! Pipeline triggers and build features
//!
//! This module defines the trigger rules and the declared feature set of a
//! pipeline definition.

use super::errors::ValidationError;
use super::types::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Triggers for pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Enqueue a run when the watched repository changes
    VcsChange {
        /// Branch patterns; empty means every branch
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        branch_filter: Vec<String>,

        /// Delay before a queued run may start, in seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quiet_period_secs: Option<u64>,
    },
}

impl Trigger {
    /// Creates a VCS trigger watching every branch
    #[must_use]
    pub fn vcs() -> Self {
        Self::VcsChange {
            branch_filter: Vec::new(),
            quiet_period_secs: None,
        }
    }

    /// Creates a VCS trigger restricted to branches matching `patterns`
    #[must_use]
    pub fn vcs_on_branches(patterns: Vec<String>) -> Self {
        Self::VcsChange {
            branch_filter: patterns,
            quiet_period_secs: None,
        }
    }

    /// Sets the quiet period
    #[must_use]
    pub fn with_quiet_period(self, period: Duration) -> Self {
        match self {
            Self::VcsChange { branch_filter, .. } => Self::VcsChange {
                branch_filter,
                quiet_period_secs: Some(period.as_secs()),
            },
        }
    }

    /// Returns the declared quiet period, if any
    #[must_use]
    pub fn quiet_period(&self) -> Option<Duration> {
        match self {
            Self::VcsChange {
                quiet_period_secs, ..
            } => quiet_period_secs.map(Duration::from_secs),
        }
    }

    /// Returns true if a change on `branch` matches this trigger
    ///
    /// A change without branch information matches every trigger.
    #[must_use]
    pub fn matches_branch(&self, branch: Option<&str>) -> bool {
        match self {
            Self::VcsChange { branch_filter, .. } => {
                let Some(branch) = branch else {
                    return true;
                };
                if branch_filter.is_empty() {
                    return true;
                }
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                branch_filter.iter().any(|pattern| {
                    glob::Pattern::new(pattern)
                        .map(|p| p.matches(branch) || p.matches(short))
                        .unwrap_or(false)
                })
            }
        }
    }
}

impl Validate for Trigger {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        match self {
            Self::VcsChange { branch_filter, .. } => {
                for pattern in branch_filter {
                    glob::Pattern::new(pattern).map_err(|e| ValidationError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                }
                Ok(())
            }
        }
    }
}

/// Build features attached to a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Feature {
    /// Record per-step performance samples
    Perfmon,

    /// Ask the runtime integration to clean the checkout around the run
    CleanCheckout {
        /// Force a clean checkout before the run
        #[serde(default)]
        force: bool,
        /// Verbose cleanup output
        #[serde(default)]
        verbose: bool,
    },
}
