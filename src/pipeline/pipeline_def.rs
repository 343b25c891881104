//! Pipeline definition and builder

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use crate::pipeline::artifact_rule::{ArtifactRule, deserialize_rules};
use crate::pipeline::errors::{PipelineError, ValidationError};
use crate::pipeline::options::{Feature, Trigger};
use crate::pipeline::steps::{ExecutionMode, Step, StepKind, StepRef};
use crate::pipeline::types::Validate;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

const MAX_NAME_LEN: usize = 255;

fn default_version() -> u32 {
    1
}

/// A named, versioned declarative pipeline
///
/// Immutable once loaded; changing it means registering a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Definition name, also its identity
    pub name: String,

    /// Definition version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Declared build parameters (name → default value)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Ordered steps; ordinals are positions in this list
    pub steps: Vec<Step>,

    /// Trigger rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,

    /// Declared features
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<Feature>,

    /// Artifact rules in declaration order
    #[serde(
        default,
        deserialize_with = "deserialize_rules",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub artifact_rules: Vec<ArtifactRule>,
}

impl Validate for PipelineDefinition {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                max: MAX_NAME_LEN,
                len: self.name.len(),
            });
        }
        // The name doubles as a workspace and artifact directory name.
        if self.name.starts_with('.') || self.name.contains(['/', '\\', '\0']) {
            return Err(ValidationError::InvalidNameChars {
                name: self.name.clone(),
            });
        }

        for name in self.parameters.keys() {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !valid {
                return Err(ValidationError::InvalidNameChars { name: name.clone() });
            }
        }

        let mut seen_ids: AHashMap<&str, usize> = AHashMap::new();
        for (ordinal, step) in self.steps.iter().enumerate() {
            if let Some(id) = step.id.as_deref() {
                if let Some(&first) = seen_ids.get(id) {
                    return Err(ValidationError::DuplicateStepId {
                        id: id.to_string(),
                        first,
                        second: ordinal,
                    });
                }
                seen_ids.insert(id, ordinal);
            }
            validate_step(ordinal, step)?;
        }

        for trigger in &self.triggers {
            trigger.validate()?;
        }

        for rule in &self.artifact_rules {
            rule.validate()?;
        }

        Ok(())
    }
}

fn validate_step(ordinal: usize, step: &Step) -> Result<(), ValidationError> {
    if step.timeout_secs == Some(0) {
        return Err(ValidationError::InvalidTimeout { value: 0 });
    }
    let empty = |field: &'static str| ValidationError::EmptyPayload { ordinal, field };
    match &step.kind {
        StepKind::Script { content } if content.trim().is_empty() => Err(empty("content")),
        StepKind::ContainerCommand { subcommand, .. } if subcommand.trim().is_empty() => {
            Err(empty("subcommand"))
        }
        StepKind::RemoteCommand { commands } => {
            if commands.trim().is_empty() {
                return Err(empty("commands"));
            }
            match &step.side_effects.remote {
                Some(remote) if !remote.host.trim().is_empty() => Ok(()),
                _ => Err(ValidationError::MissingRemoteHost { ordinal }),
            }
        }
        StepKind::ToolInvocation { tool, .. } if tool.trim().is_empty() => Err(empty("tool")),
        _ => Ok(()),
    }
}

impl PipelineDefinition {
    /// Creates a new definition builder
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Parses and validates a YAML definition
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] or [`PipelineError::Validation`].
    pub fn from_yaml_str(source: &str) -> Result<Self, PipelineError> {
        let definition: Self = serde_yaml::from_str(source)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parses and validates a JSON definition
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] or [`PipelineError::Validation`].
    pub fn from_json_str(source: &str) -> Result<Self, PipelineError> {
        let definition: Self = serde_json::from_str(source)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Loads a definition file, picking the format from its extension
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, has an unknown extension,
    /// or does not describe a valid definition.
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let source = std::fs::read_to_string(path)?;
        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&source),
            "json" => Self::from_json_str(&source),
            other => Err(PipelineError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Returns number of steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Iterates steps with their ordinals
    pub fn ordered_steps(&self) -> impl Iterator<Item = (usize, &Step)> {
        self.steps.iter().enumerate()
    }

    /// References to every step, in ordinal order
    pub fn step_refs(&self) -> Vec<StepRef> {
        self.ordered_steps()
            .map(|(ordinal, step)| StepRef::new(ordinal, step))
            .collect()
    }

    /// Looks a step up by id
    pub fn step_by_id(&self, id: &str) -> Option<(usize, &Step)> {
        self.ordered_steps()
            .find(|(_, step)| step.id.as_deref() == Some(id))
    }

    /// Returns true if the definition declares `feature`
    pub fn has_feature(&self, feature: &Feature) -> bool {
        self.features.contains(feature)
    }

    /// Returns true if any step must run regardless of failures
    pub fn has_cleanup_steps(&self) -> bool {
        self.steps.iter().any(|s| s.mode == ExecutionMode::Always)
    }
}

impl fmt::Display for PipelineDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline({} v{}): {} steps",
            self.name,
            self.version,
            self.steps.len()
        )
    }
}

/// Builder for creating pipeline definitions
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    definition: PipelineDefinition,
}

impl PipelineBuilder {
    /// Creates a new builder for a definition called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: PipelineDefinition {
                name: name.into(),
                version: default_version(),
                parameters: BTreeMap::new(),
                steps: Vec::new(),
                triggers: Vec::new(),
                features: Vec::new(),
                artifact_rules: Vec::new(),
            },
        }
    }

    /// Sets the version
    pub fn version(mut self, version: u32) -> Self {
        self.definition.version = version;
        self
    }

    /// Declares a build parameter with its default value
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.definition.parameters.insert(name.into(), value.into());
        self
    }

    /// Appends a step
    pub fn step(mut self, step: Step) -> Self {
        self.definition.steps.push(step);
        self
    }

    /// Appends multiple steps
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.definition.steps.extend(steps);
        self
    }

    /// Adds a trigger
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.definition.triggers.push(trigger);
        self
    }

    /// Adds a feature
    pub fn feature(mut self, feature: Feature) -> Self {
        self.definition.features.push(feature);
        self
    }

    /// Adds an artifact rule
    pub fn artifact_rule(mut self, rule: ArtifactRule) -> Self {
        self.definition.artifact_rules.push(rule);
        self
    }

    /// Builds the definition
    #[allow(clippy::missing_errors_doc)]
    pub fn build(self) -> Result<PipelineDefinition, ValidationError> {
        self.definition.validate()?;
        Ok(self.definition)
    }

    /// Builds the definition without validation (for internal use)
    #[must_use]
    pub fn build_unchecked(self) -> PipelineDefinition {
        self.definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::steps::ContainerSettings;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const TRIVY: &str = r#"
name: Trivy Scan
parameters:
  DOCKER_TAG: "%build.number%-%build.vcs.number.1%"
steps:
  - kind: script
    id: build_and_trivy_scan
    name: Build and Trivy Scan
    content: |
      docker build -t scan-image:%DOCKER_TAG% .
    container:
      image: docker:latest
      pull: true
      run_parameters: "-v /var/run/docker.sock:/var/run/docker.sock"
  - kind: script
    name: Cleanup
    mode: always
    content: docker image prune -f || true
triggers:
  - kind: vcs_change
features:
  - kind: perfmon
  - kind: clean_checkout
    force: true
    verbose: true
artifact_rules: |
  trivy-results.json
"#;

    #[test]
    fn test_from_yaml_str() {
        let def = PipelineDefinition::from_yaml_str(TRIVY).unwrap();
        assert_eq!(def.name, "Trivy Scan");
        assert_eq!(def.version, 1);
        assert_eq!(def.step_count(), 2);
        assert_eq!(def.steps[1].mode, ExecutionMode::Always);
        assert_eq!(def.artifact_rules, vec![ArtifactRule::new("trivy-results.json")]);
        assert!(def.has_feature(&Feature::Perfmon));
        assert!(def.has_cleanup_steps());
        assert_eq!(
            def.step_by_id("build_and_trivy_scan").map(|(o, _)| o),
            Some(0)
        );
    }

    #[test]
    fn test_from_json_str_with_rule_list() {
        let json = r#"{
            "name": "maven",
            "steps": [{"kind": "tool_invocation", "tool": "maven", "targets": "clean package"}],
            "artifact_rules": ["target/*.jar => artifacts"]
        }"#;
        let def = PipelineDefinition::from_json_str(json).unwrap();
        assert_eq!(
            def.artifact_rules,
            vec![ArtifactRule::with_destination("target/*.jar", "artifacts")]
        );
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let result = PipelineDefinition::builder("dup")
            .step(Step::script("a").with_id("x"))
            .step(Step::script("b"))
            .step(Step::script("c").with_id("x"))
            .build();
        assert_eq!(
            result,
            Err(ValidationError::DuplicateStepId {
                id: "x".to_string(),
                first: 0,
                second: 2
            })
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = PipelineDefinition::builder("  ").step(Step::script("a")).build();
        assert_eq!(result, Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let result = PipelineDefinition::builder("p").step(Step::script("  ")).build();
        assert!(matches!(
            result,
            Err(ValidationError::EmptyPayload { ordinal: 0, .. })
        ));
    }

    #[test]
    fn test_remote_command_requires_host() {
        let result = PipelineDefinition::builder("p")
            .step(Step::new(StepKind::remote_command("ls")))
            .build();
        assert_eq!(result, Err(ValidationError::MissingRemoteHost { ordinal: 0 }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut step = Step::script("a");
        step.timeout_secs = Some(0);
        let result = PipelineDefinition::builder("p").step(step).build();
        assert_eq!(result, Err(ValidationError::InvalidTimeout { value: 0 }));
    }

    #[test]
    fn test_name_must_be_a_single_path_component() {
        for name in ["/tmp/elsewhere", "../../etc", "..", ".hidden", "a/b", "a\\b"] {
            let result = PipelineDefinition::builder(name)
                .step(Step::script("a"))
                .build();
            assert_eq!(
                result,
                Err(ValidationError::InvalidNameChars {
                    name: name.to_string()
                }),
                "{name}"
            );
        }
        for name in ["Trivy Scan", "app-1.2", "deploy..prod"] {
            assert!(
                PipelineDefinition::builder(name)
                    .step(Step::script("a"))
                    .build()
                    .is_ok(),
                "{name}"
            );
        }
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "name = 'x'").unwrap();
        assert!(matches!(
            PipelineDefinition::from_path(&path),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_from_path_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trivy.yml");
        std::fs::write(&path, TRIVY).unwrap();
        let def = PipelineDefinition::from_path(&path).unwrap();
        assert_eq!(def.name, "Trivy Scan");
        assert!(matches!(
            def.steps[0].side_effects.container,
            Some(ContainerSettings { pull: true, .. })
        ));
    }

    #[test]
    fn test_display() {
        let def = PipelineDefinition::builder("p")
            .version(3)
            .step(Step::script("a"))
            .build_unchecked();
        assert_eq!(def.to_string(), "Pipeline(p v3): 1 steps");
    }

    proptest! {
        #[test]
        fn prop_step_ordinals_contiguous(count in 0usize..40) {
            let def = PipelineDefinition::builder("p")
                .steps((0..count).map(|i| Step::script(format!("echo {i}"))))
                .build_unchecked();
            let ordinals: Vec<usize> = def.step_refs().iter().map(|r| r.ordinal).collect();
            prop_assert_eq!(ordinals, (0..count).collect::<Vec<_>>());
        }
    }
}
