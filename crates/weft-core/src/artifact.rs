use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::path::AbsolutePath;

/// Stable identity of a pip.
///
/// Derived from the pip's semantic surface (see [`crate::Pip::semantic_id`]) rather than its
/// position in the graph, so adding or removing unrelated pips keeps every other id intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipId(u64);

impl PipId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Hash an ordered list of identity fields into an id.
    pub fn from_identity<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(raw))
    }
}

impl fmt::Display for PipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pip{:016X}", self.0)
    }
}

/// Index into the graph's seal table. `0` is reserved for ordinary directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealId(u32);

impl SealId {
    pub const UNSEALED: SealId = SealId(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn is_sealed(self) -> bool {
        self.0 != 0
    }
}

/// One version of a file.
///
/// `rewrite_count == 0` is a source file; `n > 0` is the file as left by the n-th pip that
/// wrote it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileArtifact {
    pub path: AbsolutePath,
    pub rewrite_count: u32,
}

impl FileArtifact {
    pub fn source(path: AbsolutePath) -> Self {
        Self {
            path,
            rewrite_count: 0,
        }
    }

    pub fn output(path: AbsolutePath) -> Self {
        Self {
            path,
            rewrite_count: 1,
        }
    }

    pub fn is_source(self) -> bool {
        self.rewrite_count == 0
    }

    pub fn is_output(self) -> bool {
        self.rewrite_count > 0
    }

    /// The version produced by rewriting this one in place.
    pub fn next_rewrite(self) -> Self {
        Self {
            path: self.path,
            rewrite_count: self.rewrite_count + 1,
        }
    }

    /// The version this one rewrote, if any.
    pub fn previous_rewrite(self) -> Option<Self> {
        (self.rewrite_count > 1).then(|| Self {
            path: self.path,
            rewrite_count: self.rewrite_count - 1,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectoryArtifact {
    pub path: AbsolutePath,
    pub seal_id: SealId,
}

impl DirectoryArtifact {
    pub fn unsealed(path: AbsolutePath) -> Self {
        Self {
            path,
            seal_id: SealId::UNSEALED,
        }
    }

    pub fn is_sealed(self) -> bool {
        self.seal_id.is_sealed()
    }
}
