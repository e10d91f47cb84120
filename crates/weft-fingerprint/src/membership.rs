use std::collections::BTreeSet;
use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use weft_core::{AbsolutePath, DirectoryArtifact, MountKind, PipGraph, SealKind};

use crate::error::FingerprintError;
use crate::fs::FileSystemView;
use crate::hash::{FingerprintBuilder, MembershipFingerprint};

/// Case-insensitive glob over an entry's final path component.
#[derive(Debug, Clone)]
pub struct EnumerationPattern {
    raw: String,
    matcher: Option<GlobMatcher>,
}

impl EnumerationPattern {
    pub fn new(pattern: Option<&str>) -> Result<Self, FingerprintError> {
        let raw = pattern.unwrap_or("").trim();
        if raw.is_empty() || raw == "*" {
            return Ok(Self::any());
        }
        let glob = GlobBuilder::new(raw)
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .map_err(|source| FingerprintError::InvalidPattern {
                pattern: raw.to_string(),
                source,
            })?;
        Ok(Self {
            raw: raw.to_string(),
            matcher: Some(glob.compile_matcher()),
        })
    }

    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            matcher: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(matcher) => matcher.is_match(name),
        }
    }
}

/// Result of fingerprinting one enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipResult {
    pub fingerprint: MembershipFingerprint,
    /// Entries that contributed, as `(path, is_directory)`, sorted by case-folded name.
    pub entries: Vec<(AbsolutePath, bool)>,
}

/// Which listing stands in for "the directory's members".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MembershipSource {
    SealMembers,
    FileSystem,
    GraphOutputs,
}

/// Computes enumeration fingerprints.
///
/// Sources and opaque outputs are listed from disk; other read/write locations use the set of
/// outputs the graph declares, so deleting or recreating output files never changes the
/// result. Partial seals always use their fixed member list.
pub struct DirectoryMembershipFingerprinter<'a> {
    graph: &'a PipGraph,
    fs: &'a dyn FileSystemView,
}

impl<'a> DirectoryMembershipFingerprinter<'a> {
    pub fn new(graph: &'a PipGraph, fs: &'a dyn FileSystemView) -> Self {
        Self { graph, fs }
    }

    /// Fingerprint of a missing directory, or of a path that is not a directory.
    pub fn absent() -> MembershipFingerprint {
        let mut fp = FingerprintBuilder::new("weft.membership");
        fp.str("state", "absent");
        MembershipFingerprint::from_digest(fp.finish())
    }

    /// Fingerprint the members of `directory` that match `pattern`.
    ///
    /// `consumed`, when set, restricts the listing to entries the pip went on to use; search
    /// path tools pass it so unrelated entries appearing later keep the fingerprint stable.
    pub fn fingerprint(
        &self,
        directory: DirectoryArtifact,
        pattern: &EnumerationPattern,
        mount_kind: MountKind,
        consumed: Option<&BTreeSet<AbsolutePath>>,
    ) -> Result<MembershipResult, FingerprintError> {
        let table = self.graph.path_table();
        let source = self.source_for(directory, mount_kind)?;

        let listing: Option<Vec<(AbsolutePath, bool)>> = match source {
            MembershipSource::SealMembers => Some(self.seal_members(directory)?),
            MembershipSource::FileSystem => {
                let text = table.expand(directory.path);
                let path = Path::new(&*text);
                if self.fs.is_directory(path) {
                    let entries = self
                        .fs
                        .enumerate(path)
                        .map_err(|err| FingerprintError::io(text.to_string(), err))?;
                    let mut children = Vec::with_capacity(entries.len());
                    for entry in entries {
                        let child = table.child(directory.path, &entry.name)?;
                        children.push((child, entry.is_directory));
                    }
                    Some(children)
                } else {
                    None
                }
            }
            MembershipSource::GraphOutputs => {
                let known = self.graph.known_members(directory.path);
                if known.is_empty() && !self.graph.is_known_directory(directory.path) {
                    None
                } else {
                    Some(known)
                }
            }
        };

        let Some(listing) = listing else {
            return Ok(MembershipResult {
                fingerprint: Self::absent(),
                entries: Vec::new(),
            });
        };

        let mut entries: Vec<(String, AbsolutePath, bool)> = listing
            .into_iter()
            .filter(|(path, _)| consumed.map_or(true, |set| set.contains(path)))
            .map(|(path, is_directory)| {
                (table.file_name(path).to_lowercase(), path, is_directory)
            })
            .filter(|(name, _, _)| pattern.matches(name))
            .collect();
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);

        let mut fp = FingerprintBuilder::new("weft.membership");
        fp.str("state", "present")
            .str("pattern", &pattern.as_str().to_lowercase())
            .u64("entries", entries.len() as u64);
        for (name, _, is_directory) in &entries {
            fp.str("name", name).bool("dir", *is_directory);
        }

        tracing::trace!(
            target = "weft.fingerprint",
            directory = %table.display(directory.path),
            source = ?source,
            entries = entries.len(),
            "fingerprinted directory membership"
        );

        Ok(MembershipResult {
            fingerprint: MembershipFingerprint::from_digest(fp.finish()),
            entries: entries
                .into_iter()
                .map(|(_, path, is_directory)| (path, is_directory))
                .collect(),
        })
    }

    fn source_for(
        &self,
        directory: DirectoryArtifact,
        mount_kind: MountKind,
    ) -> Result<MembershipSource, FingerprintError> {
        if directory.is_sealed() {
            let seal = self
                .graph
                .seal(directory.seal_id)
                .ok_or(FingerprintError::UnknownSeal(directory.seal_id))?;
            return Ok(match seal.kind {
                SealKind::Partial { .. } => MembershipSource::SealMembers,
                SealKind::Opaque
                | SealKind::SourceAllDirectories
                | SealKind::SourceTopDirectoryOnly => MembershipSource::FileSystem,
            });
        }
        Ok(match mount_kind {
            MountKind::ReadOnly => MembershipSource::FileSystem,
            MountKind::ReadWrite => MembershipSource::GraphOutputs,
        })
    }

    /// Direct children of `directory` implied by a partial seal's member list.
    fn seal_members(
        &self,
        directory: DirectoryArtifact,
    ) -> Result<Vec<(AbsolutePath, bool)>, FingerprintError> {
        let table = self.graph.path_table();
        let seal = self
            .graph
            .seal(directory.seal_id)
            .ok_or(FingerprintError::UnknownSeal(directory.seal_id))?;
        let mut children = BTreeSet::new();
        for member in seal.members() {
            let mut current = member.path;
            let mut is_directory = false;
            while let Some(parent) = table.parent(current) {
                if parent == directory.path {
                    children.insert((current, is_directory));
                    break;
                }
                current = parent;
                is_directory = true;
            }
        }
        Ok(children.into_iter().collect())
    }
}
