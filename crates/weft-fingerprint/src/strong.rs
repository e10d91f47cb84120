use serde::{Deserialize, Serialize};
use weft_core::{AbsolutePath, PathError, PathTable};

use crate::hash::{
    ContentHash, FingerprintBuilder, MembershipFingerprint, PathSetHash, StrongFingerprint,
    WeakFingerprint,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservedPathEntryFlags {
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub is_file_probe: bool,
    #[serde(default)]
    pub is_enumeration: bool,
}

impl ObservedPathEntryFlags {
    fn bits(self) -> u64 {
        u64::from(self.is_directory)
            | u64::from(self.is_file_probe) << 1
            | u64::from(self.is_enumeration) << 2
    }
}

/// One location a pip touched, as recorded in its path set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservedPathEntry {
    pub path: AbsolutePath,
    pub flags: ObservedPathEntryFlags,
    /// Filter applied by an enumeration; `None` matches everything.
    pub enumerate_pattern: Option<String>,
}

impl ObservedPathEntry {
    pub fn probe(path: AbsolutePath, is_directory: bool) -> Self {
        Self {
            path,
            flags: ObservedPathEntryFlags {
                is_directory,
                is_file_probe: true,
                is_enumeration: false,
            },
            enumerate_pattern: None,
        }
    }

    pub fn read(path: AbsolutePath) -> Self {
        Self {
            path,
            flags: ObservedPathEntryFlags::default(),
            enumerate_pattern: None,
        }
    }

    pub fn enumeration(path: AbsolutePath, pattern: Option<String>) -> Self {
        Self {
            path,
            flags: ObservedPathEntryFlags {
                is_directory: true,
                is_file_probe: false,
                is_enumeration: true,
            },
            enumerate_pattern: pattern.filter(|p| !p.is_empty() && p != "*"),
        }
    }
}

/// Sorted, deduplicated set of observed paths from one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedPathSet {
    entries: Vec<ObservedPathEntry>,
}

impl ObservedPathSet {
    /// Canonicalise `entries`: sort by case-folded path and merge duplicates.
    ///
    /// A path reported as both a probe and a read keeps the read, and an enumeration wins
    /// over both.
    pub fn new(table: &PathTable, entries: impl IntoIterator<Item = ObservedPathEntry>) -> Self {
        let mut keyed: Vec<(String, ObservedPathEntry)> = entries
            .into_iter()
            .map(|entry| (table.canonical_key(entry.path), entry))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut merged: Vec<ObservedPathEntry> = Vec::with_capacity(keyed.len());
        for (_, entry) in keyed {
            match merged.last_mut() {
                Some(last) if last.path == entry.path => {
                    let flags = &mut last.flags;
                    flags.is_directory |= entry.flags.is_directory;
                    if entry.flags.is_enumeration {
                        flags.is_enumeration = true;
                        last.enumerate_pattern = entry.enumerate_pattern;
                    }
                    flags.is_file_probe &= entry.flags.is_file_probe;
                }
                _ => merged.push(entry),
            }
        }
        Self { entries: merged }
    }

    pub fn entries(&self) -> &[ObservedPathEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: AbsolutePath) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    /// String form suitable for an external cache.
    pub fn to_serialized(&self, table: &PathTable) -> SerializedPathSet {
        SerializedPathSet {
            entries: self
                .entries
                .iter()
                .map(|entry| SerializedPathEntry {
                    path: table.expand(entry.path).to_string(),
                    flags: entry.flags,
                    pattern: entry.enumerate_pattern.clone(),
                })
                .collect(),
        }
    }

    pub fn from_serialized(
        table: &PathTable,
        serialized: &SerializedPathSet,
    ) -> Result<Self, PathError> {
        let mut entries = Vec::with_capacity(serialized.entries.len());
        for entry in &serialized.entries {
            entries.push(ObservedPathEntry {
                path: table.intern(&entry.path)?,
                flags: entry.flags,
                enumerate_pattern: entry.pattern.clone(),
            });
        }
        Ok(Self::new(table, entries))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPathSet {
    pub entries: Vec<SerializedPathEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPathEntry {
    pub path: String,
    pub flags: ObservedPathEntryFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// What a path-set entry resolved to when evaluated against the current file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedInputKind {
    AbsentPath,
    FileContent(ContentHash),
    ExistingFileProbe,
    ExistingDirectoryProbe,
    DirectoryEnumeration(MembershipFingerprint),
}

impl ObservedInputKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ObservedInputKind::AbsentPath => "absent",
            ObservedInputKind::FileContent(_) => "content",
            ObservedInputKind::ExistingFileProbe => "file_probe",
            ObservedInputKind::ExistingDirectoryProbe => "dir_probe",
            ObservedInputKind::DirectoryEnumeration(_) => "enumeration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservedInput {
    pub entry: ObservedPathEntry,
    pub kind: ObservedInputKind,
}

pub fn compute_path_set_hash(table: &PathTable, path_set: &ObservedPathSet) -> PathSetHash {
    let mut fp = FingerprintBuilder::new("weft.pathset");
    fp.u64("entries", path_set.len() as u64);
    for entry in path_set.entries() {
        fp.str("path", &table.canonical_key(entry.path))
            .u64("flags", entry.flags.bits())
            .str("pattern", entry.enumerate_pattern.as_deref().unwrap_or("*"));
    }
    PathSetHash::from_digest(fp.finish())
}

/// Extend `weak` with the observed inputs of one execution.
///
/// Inputs are sorted by (case-folded path, kind tag) first, so the result does not depend on
/// the order in which accesses were reported.
pub fn compute_strong_fingerprint(
    table: &PathTable,
    weak: WeakFingerprint,
    path_set_hash: PathSetHash,
    observed_inputs: &[ObservedInput],
) -> StrongFingerprint {
    let mut keyed: Vec<(String, &'static str, &ObservedInput)> = observed_inputs
        .iter()
        .map(|input| (table.canonical_key(input.entry.path), input.kind.tag(), input))
        .collect();
    keyed.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

    let mut fp = FingerprintBuilder::new("weft.strong");
    fp.digest("weak", weak.as_bytes())
        .digest("path_set", path_set_hash.as_bytes())
        .u64("inputs", keyed.len() as u64);
    for (key, tag, input) in keyed {
        fp.str("path", &key).str("kind", tag);
        match input.kind {
            ObservedInputKind::FileContent(hash) => {
                fp.digest("content", hash.as_bytes());
            }
            ObservedInputKind::DirectoryEnumeration(membership) => {
                fp.digest("membership", membership.as_bytes());
            }
            ObservedInputKind::AbsentPath
            | ObservedInputKind::ExistingFileProbe
            | ObservedInputKind::ExistingDirectoryProbe => {}
        }
    }
    StrongFingerprint::from_digest(fp.finish())
}
