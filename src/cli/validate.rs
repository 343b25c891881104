//! `buildline validate` - Check definition files
//!
//! Loads every file and runs definition validation without executing
//! anything.
//!
//! ## Usage
//!
//! ```bash
//! buildline validate pipelines/*.yaml
//! # Exit code 0: all definitions valid
//! # Exit code 1: at least one definition invalid
//! ```

use anyhow::Result;
use buildline::pipeline::PipelineDefinition;
use std::path::{Path, PathBuf};

/// Outcome for one file
#[derive(Debug)]
pub struct FileReport {
    /// File checked
    pub path: PathBuf,
    /// Definition summary, or the error message
    pub outcome: Result<String, String>,
}

/// Validates one definition file
pub fn validate_file(path: &Path) -> FileReport {
    tracing::debug!(file = %path.display(), "Validating definition");
    let outcome = PipelineDefinition::from_path(path)
        .map(|definition| {
            format!(
                "{} v{} ({} steps, {} artifact rules)",
                definition.name,
                definition.version,
                definition.step_count(),
                definition.artifact_rules.len()
            )
        })
        .map_err(|e| e.to_string());
    FileReport {
        path: path.to_path_buf(),
        outcome,
    }
}

/// Validates every file and prints one line per file
///
/// Returns `Ok(true)` if all files are valid.
pub fn validate_files(files: &[PathBuf]) -> Result<bool> {
    let mut all_valid = true;
    for report in files.iter().map(|f| validate_file(f)) {
        match &report.outcome {
            Ok(summary) => println!("ok    {}: {summary}", report.path.display()),
            Err(error) => {
                all_valid = false;
                println!("error {}: {error}", report.path.display());
            }
        }
    }
    Ok(all_valid)
}
