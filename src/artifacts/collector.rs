//! Artifact collection
//!
//! Rules are matched against the run workspace after the last step. Each
//! matched file is staged under a destination label; matched directories
//! contribute every file below them. Destinations are keyed, so when two
//! rules stage the same destination the later rule wins. Nothing outside
//! the workspace is ever staged, including through symlinks.

use crate::pipeline::ArtifactRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const GLOB_CHARS: [char; 4] = ['*', '?', '[', '{'];

/// Failures while matching rules against a workspace
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    /// Source pattern is not a valid glob
    #[error("Invalid artifact pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Parser message
        reason: String,
    },

    /// Filesystem error while walking matches
    #[error("IO error at {path}: {reason}")]
    Io {
        /// Path being read
        path: String,
        /// OS error text
        reason: String,
    },
}

/// One staged artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Destination path, `/`-separated
    pub destination: String,
    /// Source path relative to the workspace
    pub source: String,
    /// Size in bytes
    pub size: u64,
}

/// Artifacts staged for a run, sorted by destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Staged entries
    pub entries: Vec<ArtifactEntry>,
}

impl ArtifactManifest {
    /// Number of staged artifacts
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry staged at `destination`
    #[must_use]
    pub fn get(&self, destination: &str) -> Option<&ArtifactEntry> {
        self.entries.iter().find(|e| e.destination == destination)
    }

    /// Total size in bytes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Leading path components of `pattern` that contain no glob characters
fn literal_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    // The last component names the match itself, never part of the base.
    for component in components.iter().take(components.len().saturating_sub(1)) {
        if component.contains(GLOB_CHARS) {
            break;
        }
        base.push(component);
    }
    base
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn io_error(path: &Path, err: &std::io::Error) -> CollectionError {
    CollectionError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Every regular file at or below `root`
fn files_below(root: &Path) -> Result<Vec<PathBuf>, CollectionError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        if path.is_dir() {
            let entries = std::fs::read_dir(&path).map_err(|e| io_error(&path, &e))?;
            for entry in entries {
                let entry = entry.map_err(|e| io_error(&path, &e))?;
                stack.push(entry.path());
            }
        } else if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Matches artifact rules against a workspace
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactCollector;

impl ArtifactCollector {
    /// Creates a collector
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Applies `rules` in order to `workspace`
    ///
    /// A rule that matches nothing contributes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError`] for invalid patterns or unreadable
    /// directories.
    pub fn collect(
        &self,
        workspace: &Path,
        rules: &[ArtifactRule],
    ) -> Result<ArtifactManifest, CollectionError> {
        let mut staged: BTreeMap<String, (String, u64)> = BTreeMap::new();
        let escaped_root = glob::Pattern::escape(&workspace.to_string_lossy());
        let real_root = match workspace.canonicalize() {
            Ok(root) => root,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ArtifactManifest::default());
            }
            Err(e) => return Err(io_error(workspace, &e)),
        };

        for rule in rules {
            if !rule.is_contained() {
                tracing::warn!(rule = %rule, "Artifact rule leaves the workspace, skipped");
                continue;
            }
            let source = rule.source.trim_start_matches("./");
            let pattern = format!("{escaped_root}/{source}");
            let matches = glob::glob(&pattern).map_err(|e| CollectionError::InvalidPattern {
                pattern: rule.source.clone(),
                reason: e.to_string(),
            })?;
            let base = workspace.join(literal_base(source));

            let mut matched = 0usize;
            for path in matches {
                let path = path.map_err(|e| io_error(e.path(), e.error()))?;
                for file in files_below(&path)? {
                    let Ok(relative) = file.strip_prefix(workspace) else {
                        continue;
                    };
                    let inside = file
                        .canonicalize()
                        .is_ok_and(|real| real.starts_with(&real_root));
                    if !inside {
                        tracing::warn!(path = %file.display(), "Artifact outside the workspace, skipped");
                        continue;
                    }
                    let source_rel = to_slash(relative);
                    let destination = match &rule.destination {
                        Some(dest) => {
                            let below_base = file.strip_prefix(&base).unwrap_or(relative);
                            let label = dest.trim_matches('/');
                            format!("{label}/{}", to_slash(below_base))
                        }
                        None => source_rel.clone(),
                    };
                    let size = std::fs::metadata(&file)
                        .map_err(|e| io_error(&file, &e))?
                        .len();
                    if let Some((previous, _)) =
                        staged.insert(destination.clone(), (source_rel.clone(), size))
                    {
                        tracing::debug!(
                            destination = %destination,
                            previous = %previous,
                            source = %source_rel,
                            "Artifact destination overwritten"
                        );
                    }
                    matched += 1;
                }
            }
            tracing::debug!(rule = %rule, matched, "Artifact rule applied");
        }

        Ok(ArtifactManifest {
            entries: staged
                .into_iter()
                .map(|(destination, (source, size))| ArtifactEntry {
                    destination,
                    source,
                    size,
                })
                .collect(),
        })
    }
}
