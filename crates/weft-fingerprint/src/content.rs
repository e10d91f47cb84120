use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use weft_core::{AbsolutePath, FileArtifact, PipGraph};

use crate::error::FingerprintError;
use crate::fs::FileSystemView;
use crate::hash::ContentHash;

/// Per-session content hashes of file artifacts.
///
/// Source files are hashed lazily on first use. Produced versions are recorded by the
/// scheduler once a pip executes or replays from cache; they are never read back from disk,
/// since a later rewrite may already have replaced the bytes.
pub struct FileContentTable {
    fs: Arc<dyn FileSystemView>,
    hashes: RwLock<HashMap<FileArtifact, ContentHash>>,
}

impl FileContentTable {
    pub fn new(fs: Arc<dyn FileSystemView>) -> Self {
        Self {
            fs,
            hashes: RwLock::new(HashMap::new()),
        }
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystemView> {
        &self.fs
    }

    pub fn record(&self, artifact: FileArtifact, hash: ContentHash) {
        self.hashes.write().insert(artifact, hash);
    }

    pub fn recorded(&self, artifact: FileArtifact) -> Option<ContentHash> {
        self.hashes.read().get(&artifact).copied()
    }

    /// Hash of a declared artifact version.
    pub fn content_of(
        &self,
        graph: &PipGraph,
        artifact: FileArtifact,
    ) -> Result<ContentHash, FingerprintError> {
        if let Some(hash) = self.recorded(artifact) {
            return Ok(hash);
        }
        if artifact.is_output() {
            return Err(FingerprintError::UnknownArtifact {
                path: graph.path_table().expand(artifact.path).to_string(),
                rewrite_count: artifact.rewrite_count,
            });
        }

        let hash = self.hash_path(graph, artifact.path)?;
        self.hashes.write().entry(artifact).or_insert(hash);
        Ok(hash)
    }

    /// Hash whatever is on disk at `path` right now. Not memoized.
    pub fn hash_path(
        &self,
        graph: &PipGraph,
        path: AbsolutePath,
    ) -> Result<ContentHash, FingerprintError> {
        ensure_trackable(graph, path)?;
        let text = graph.path_table().expand(path);
        let bytes = self
            .fs
            .read_file(Path::new(&*text))
            .map_err(|err| FingerprintError::io(text.to_string(), err))?;
        Ok(ContentHash::of(bytes))
    }
}

/// Fails with [`FingerprintError::UntrackableMount`] when `path` lies under a mount whose
/// content may not be hashed.
pub fn ensure_trackable(graph: &PipGraph, path: AbsolutePath) -> Result<(), FingerprintError> {
    let table = graph.path_table();
    match graph.mounts().resolve(table, path) {
        Some(mount) if !mount.policy.trackable => Err(FingerprintError::UntrackableMount {
            path: table.expand(path).to_string(),
            mount: mount.name.clone(),
        }),
        _ => Ok(()),
    }
}
