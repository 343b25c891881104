//! Run scheduling
//!
//! Definitions are registered in a [`DefinitionRegistry`]. The
//! [`TriggerEvaluator`] turns change events and manual requests into queued
//! runs and the [`Dispatcher`] executes them.

mod dispatcher;
mod evaluator;
mod registry;

pub use dispatcher::Dispatcher;
pub use evaluator::{EnqueueDecision, ScheduledRun, TriggerEvaluator, VcsChangeEvent};
pub use registry::DefinitionRegistry;

use crate::pipeline::ValidationError;
use thiserror::Error;

/// Scheduling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// No definition registered under this name
    #[error("Unknown pipeline definition '{name}'")]
    UnknownDefinition {
        /// Requested name
        name: String,
    },

    /// A definition with the same or a newer version is registered
    #[error("Definition '{name}' version {offered} is not newer than registered version {current}")]
    StaleVersion {
        /// Definition name
        name: String,
        /// Registered version
        current: u32,
        /// Rejected version
        offered: u32,
    },

    /// Definition failed validation
    #[error("Invalid definition: {0}")]
    Invalid(#[from] ValidationError),
}
