//! Artifact collection and storage

mod collector;
mod store;

pub use collector::{ArtifactCollector, ArtifactEntry, ArtifactManifest, CollectionError};
pub use store::{ArtifactStore, FsArtifactStore, HttpArtifactStore, StoreError};
