//! Artifact stores
//!
//! A store persists the artifacts staged for a finished run. Store failures
//! are reported to the caller, which logs them without changing the run
//! status.

use super::collector::ArtifactManifest;
use crate::pipeline::{PipelineRun, RunStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Artifact store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Filesystem error
    #[error("IO error at {path}: {reason}")]
    Io {
        /// Path being written
        path: String,
        /// OS error text
        reason: String,
    },

    /// Transport error talking to a remote store
    #[error("HTTP error: {0}")]
    Http(String),

    /// Remote store answered with a non-success status
    #[error("Artifact store rejected upload with status {status}")]
    Rejected {
        /// HTTP status code
        status: u16,
    },
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Persists the artifacts of a run
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `manifest`, whose sources are relative to `workspace`
    async fn store(
        &self,
        run: &PipelineRun,
        workspace: &Path,
        manifest: &ArtifactManifest,
    ) -> Result<(), StoreError>;
}

/// Copies artifacts to `<root>/<definition>/<run-number>/<destination>`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the artifacts of `run`
    #[must_use]
    pub fn run_dir(&self, run: &PipelineRun) -> PathBuf {
        self.root.join(&run.definition).join(run.number.to_string())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(
        &self,
        run: &PipelineRun,
        workspace: &Path,
        manifest: &ArtifactManifest,
    ) -> Result<(), StoreError> {
        let run_dir = self.run_dir(run);
        for entry in &manifest.entries {
            let from = workspace.join(&entry.source);
            let to = run_dir.join(&entry.destination);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, &e))?;
            }
            tokio::fs::copy(&from, &to)
                .await
                .map_err(|e| io_error(&from, &e))?;
        }
        tracing::info!(
            run = %run.id,
            definition = %run.definition,
            count = manifest.len(),
            dir = %run_dir.display(),
            "Artifacts stored"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct UploadBody<'a> {
    run_id: Uuid,
    definition: &'a str,
    number: u64,
    status: RunStatus,
    artifacts: &'a ArtifactManifest,
}

/// Posts the manifest of each run as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpArtifactStore {
    /// Creates a store posting to `endpoint`
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Endpoint the manifest is posted to
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn store(
        &self,
        run: &PipelineRun,
        _workspace: &Path,
        manifest: &ArtifactManifest,
    ) -> Result<(), StoreError> {
        let body = UploadBody {
            run_id: run.id,
            definition: &run.definition,
            number: run.number,
            status: run.status(),
            artifacts: manifest,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
            });
        }
        tracing::info!(
            run = %run.id,
            endpoint = %self.endpoint,
            count = manifest.len(),
            "Artifact manifest uploaded"
        );
        Ok(())
    }
}
