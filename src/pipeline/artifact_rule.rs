//! Artifact rules
//!
//! A rule is written `source-glob [=> destination]`. Rules are kept in
//! declaration order.

#![allow(clippy::must_use_candidate)]

use super::errors::ValidationError;
use super::types::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

const ARROW: &str = "=>";

/// A glob-based rule selecting produced files for retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRule {
    /// Glob pattern relative to the run workspace
    pub source: String,
    /// Destination label; `None` keeps the relative path
    pub destination: Option<String>,
}

impl ArtifactRule {
    /// Creates a rule without destination
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: None,
        }
    }

    /// Creates a rule staging matches under `destination`
    pub fn with_destination(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: Some(destination.into()),
        }
    }

    /// Parses a newline-separated block of rules, skipping blank lines
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidArtifactRule`] for the first
    /// malformed line.
    pub fn parse_block(block: &str) -> Result<Vec<Self>, ValidationError> {
        block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Returns true if source and destination are relative paths without
    /// `..`, so matches and staged copies stay below their roots
    pub fn is_contained(&self) -> bool {
        is_relative_below(&self.source)
            && self.destination.as_deref().is_none_or(is_relative_below)
    }
}

fn is_relative_below(path: &str) -> bool {
    !path.starts_with(['/', '\\'])
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl FromStr for ArtifactRule {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let (source, destination) = match line.split_once(ARROW) {
            Some((src, dest)) => {
                let dest = dest.trim().trim_end_matches('/');
                if dest.is_empty() || dest.contains(ARROW) {
                    return Err(ValidationError::InvalidArtifactRule(s.to_string()));
                }
                (src.trim(), Some(dest.to_string()))
            }
            None => (line, None),
        };
        if source.is_empty() {
            return Err(ValidationError::InvalidArtifactRule(s.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            destination,
        })
    }
}

impl TryFrom<String> for ArtifactRule {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactRule> for String {
    fn from(rule: ArtifactRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for ArtifactRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(dest) => write!(f, "{} {ARROW} {}", self.source, dest),
            None => write!(f, "{}", self.source),
        }
    }
}

impl Validate for ArtifactRule {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if !self.is_contained() {
            return Err(ValidationError::ArtifactPathEscapes {
                rule: self.to_string(),
            });
        }
        glob::Pattern::new(&self.source)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidPattern {
                pattern: self.source.clone(),
                reason: e.to_string(),
            })
    }
}

/// Deserializes artifact rules given either as a list or as one text block
///
/// # Errors
///
/// Returns a deserialization error if any rule is malformed.
pub fn deserialize_rules<'de, D>(deserializer: D) -> Result<Vec<ArtifactRule>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RulesInput {
        List(Vec<ArtifactRule>),
        Block(String),
    }

    match RulesInput::deserialize(deserializer)? {
        RulesInput::List(rules) => Ok(rules),
        RulesInput::Block(block) => {
            ArtifactRule::parse_block(&block).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_rule_with_destination() {
        let rule: ArtifactRule = "build/lib/*.jar => artifacts".parse().unwrap();
        assert_eq!(rule, ArtifactRule::with_destination("build/lib/*.jar", "artifacts"));
    }

    #[test]
    fn test_parse_rule_without_destination() {
        let rule: ArtifactRule = "  trivy-results.json ".parse().unwrap();
        assert_eq!(rule, ArtifactRule::new("trivy-results.json"));
    }

    #[test]
    fn test_parse_rejects_malformed_rules() {
        assert!("=> artifacts".parse::<ArtifactRule>().is_err());
        assert!("out/*.jar =>".parse::<ArtifactRule>().is_err());
        assert!("a => b => c".parse::<ArtifactRule>().is_err());
    }

    #[test]
    fn test_parse_block_skips_blank_lines() {
        let rules = ArtifactRule::parse_block(
            "\n  results/trufflehog-report.md\n\n  results/scan_output.txt\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].source, "results/scan_output.txt");
    }

    #[test]
    fn test_display_roundtrips_through_string() {
        let rule = ArtifactRule::with_destination("dist/*.jar", "artifacts");
        assert_eq!(String::from(rule.clone()), "dist/*.jar => artifacts");
        assert_eq!(ArtifactRule::try_from(rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn test_validate_rejects_invalid_glob() {
        assert!(ArtifactRule::new("out/[").validate().is_err());
        assert!(ArtifactRule::new("out/**/*.jar").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_paths_leaving_the_workspace() {
        for rule in [
            ArtifactRule::new("../def-b/secret.txt"),
            ArtifactRule::new("out/../../x"),
            ArtifactRule::new("/etc/passwd"),
            ArtifactRule::with_destination("out/*.jar", "../../store"),
            ArtifactRule::with_destination("out/*.jar", "/srv"),
        ] {
            assert_eq!(
                rule.validate(),
                Err(ValidationError::ArtifactPathEscapes {
                    rule: rule.to_string()
                })
            );
        }
        assert!(ArtifactRule::with_destination("./out/*.jar", "libs/jars").validate().is_ok());
    }
}
