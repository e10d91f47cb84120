use serde::{Deserialize, Serialize};

use crate::artifact::{DirectoryArtifact, FileArtifact, PipId, SealId};
use crate::path::{AbsolutePath, PathTable};

/// Policy of a sealed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SealKind {
    /// Everything on disk beneath the root, recursively, at fingerprint time.
    SourceAllDirectories,
    /// Only the direct children of the root that exist on disk.
    SourceTopDirectoryOnly,
    /// A fixed member list chosen when the graph was built. Sorted, never mutated.
    Partial { members: Vec<FileArtifact> },
    /// Contents produced dynamically by a pip and discovered at execution time.
    Opaque,
}

impl SealKind {
    /// Short stable tag hashed into seal tokens and shown in logs.
    pub fn tag(&self) -> &'static str {
        match self {
            SealKind::SourceAllDirectories => "source_all",
            SealKind::SourceTopDirectoryOnly => "source_top",
            SealKind::Partial { .. } => "partial",
            SealKind::Opaque => "opaque",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealDirectory {
    pub id: SealId,
    pub root: AbsolutePath,
    pub kind: SealKind,
    /// Pip that produces the contents of an opaque seal.
    pub producer: Option<PipId>,
}

/// Whether a path under a seal root belongs to the seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealMembership {
    /// The path is outside the seal root entirely.
    Outside,
    /// The path is a member (or, for partial seals, a directory leading to members).
    Member,
    /// The path is under the root but the seal does not admit it.
    NotMember,
}

impl SealDirectory {
    pub fn artifact(&self) -> DirectoryArtifact {
        DirectoryArtifact {
            path: self.root,
            seal_id: self.id,
        }
    }

    pub fn members(&self) -> &[FileArtifact] {
        match &self.kind {
            SealKind::Partial { members } => members,
            _ => &[],
        }
    }

    pub fn membership(&self, table: &PathTable, path: AbsolutePath) -> SealMembership {
        if !table.is_within(path, self.root) {
            return SealMembership::Outside;
        }
        let admitted = match &self.kind {
            SealKind::SourceAllDirectories | SealKind::Opaque => true,
            SealKind::SourceTopDirectoryOnly => {
                path == self.root || table.parent(path) == Some(self.root)
            }
            SealKind::Partial { members } => {
                path == self.root
                    || members.iter().any(|member| {
                        member.path == path || table.is_within(member.path, path)
                    })
            }
        };
        if admitted {
            SealMembership::Member
        } else {
            SealMembership::NotMember
        }
    }
}
