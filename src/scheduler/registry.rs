//! Definition registry

use super::SchedulerError;
use crate::pipeline::{PipelineDefinition, Validate};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Latest version of every known definition
///
/// Definitions are immutable once registered; registering a newer version
/// replaces the entry while runs already enqueued keep the version they
/// captured.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<AHashMap<String, Arc<PipelineDefinition>>>,
}

impl DefinitionRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers `definition`
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Invalid`] for invalid definitions and
    /// [`SchedulerError::StaleVersion`] if the registered version is not
    /// older.
    pub fn register(
        &self,
        definition: PipelineDefinition,
    ) -> Result<Arc<PipelineDefinition>, SchedulerError> {
        definition.validate()?;
        let mut definitions = self.definitions.write();
        if let Some(current) = definitions.get(&definition.name)
            && current.version >= definition.version
        {
            return Err(SchedulerError::StaleVersion {
                name: definition.name,
                current: current.version,
                offered: definition.version,
            });
        }
        tracing::info!(
            definition = %definition.name,
            version = definition.version,
            steps = definition.step_count(),
            "Definition registered"
        );
        let definition = Arc::new(definition);
        definitions.insert(definition.name.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    /// Latest version of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    /// Latest version of `name`
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownDefinition`] if absent.
    pub fn require(&self, name: &str) -> Result<Arc<PipelineDefinition>, SchedulerError> {
        self.get(name)
            .ok_or_else(|| SchedulerError::UnknownDefinition {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered definitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    /// Returns true if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}
