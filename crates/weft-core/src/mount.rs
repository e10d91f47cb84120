use serde::{Deserialize, Serialize};

use crate::path::{AbsolutePath, PathTable};

/// How files under a mount may be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountPolicy {
    /// Content under an untrackable mount may never be hashed.
    pub trackable: bool,
    /// Read-only mounts hold sources; read/write mounts hold build outputs.
    pub read_only: bool,
}

impl MountPolicy {
    pub const SOURCE: MountPolicy = MountPolicy {
        trackable: true,
        read_only: true,
    };
    pub const OUTPUT: MountPolicy = MountPolicy {
        trackable: true,
        read_only: false,
    };
    pub const UNTRACKED: MountPolicy = MountPolicy {
        trackable: false,
        read_only: true,
    };

    pub fn kind(self) -> MountKind {
        if self.read_only {
            MountKind::ReadOnly
        } else {
            MountKind::ReadWrite
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub name: String,
    pub root: AbsolutePath,
    pub policy: MountPolicy,
}

/// Configured mounts; resolution picks the innermost mount containing a path.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mount: Mount) {
        self.mounts.push(mount);
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn resolve(&self, table: &PathTable, path: AbsolutePath) -> Option<&Mount> {
        if self.mounts.is_empty() {
            return None;
        }
        // Walk from the path outwards so the innermost root wins.
        std::iter::once(path)
            .chain(table.ancestors(path))
            .find_map(|candidate| self.mounts.iter().find(|mount| mount.root == candidate))
    }

    pub fn policy(&self, table: &PathTable, path: AbsolutePath) -> Option<MountPolicy> {
        self.resolve(table, path).map(|mount| mount.policy)
    }
}
