use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use weft_core::{AbsolutePath, DirectoryArtifact, MountKind, Pip, PipGraph, SealMembership};

use crate::content::FileContentTable;
use crate::error::FingerprintError;
use crate::membership::{DirectoryMembershipFingerprinter, EnumerationPattern};
use crate::strong::{ObservedInput, ObservedInputKind, ObservedPathEntry, ObservedPathSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Probe,
    Read,
    Enumerate,
    Write,
}

impl AccessKind {
    fn severity(self) -> u8 {
        match self {
            AccessKind::Probe => 1,
            AccessKind::Read => 2,
            AccessKind::Enumerate => 3,
            AccessKind::Write => 4,
        }
    }
}

/// One file-system access reported by the sandbox for a running pip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReport {
    pub path: AbsolutePath,
    pub kind: AccessKind,
    /// Monotonic timestamp; only the relative order matters.
    pub timestamp: u64,
    pub existed: bool,
    pub enumerate_pattern: Option<String>,
}

impl AccessReport {
    pub fn new(path: AbsolutePath, kind: AccessKind, timestamp: u64, existed: bool) -> Self {
        Self {
            path,
            kind,
            timestamp,
            existed,
            enumerate_pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.enumerate_pattern = Some(pattern.into());
        self
    }
}

/// Knobs of the observed-input processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationPolicy {
    /// Executable file names whose enumerations only track entries they go on to use.
    pub search_path_tools: Vec<String>,
    /// Fail pips with violations instead of running them uncached.
    pub unexpected_file_accesses_are_errors: bool,
}

impl ObservationPolicy {
    pub fn is_search_path_tool(&self, executable_name: &str) -> bool {
        self.search_path_tools
            .iter()
            .any(|tool| tool.eq_ignore_ascii_case(executable_name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedInputStatus {
    Normal,
    /// An existing path under a seal root that the seal does not contain was accessed.
    Mismatched,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    UndeclaredRead,
    UndeclaredWrite,
    SealMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub path: AbsolutePath,
}

#[derive(Debug)]
pub struct ObservedInputResult {
    pub status: ObservedInputStatus,
    pub path_set: ObservedPathSet,
    pub observed_inputs: Vec<ObservedInput>,
    pub violations: Vec<Violation>,
    pub abort: Option<FingerprintError>,
}

impl ObservedInputResult {
    fn aborted(error: FingerprintError, violations: Vec<Violation>) -> Self {
        Self {
            status: ObservedInputStatus::Aborted,
            path_set: ObservedPathSet::default(),
            observed_inputs: Vec::new(),
            violations,
            abort: Some(error),
        }
    }

    /// Only clean executions may be stored to the cache.
    pub fn is_cacheable(&self) -> bool {
        self.status == ObservedInputStatus::Normal && self.violations.is_empty()
    }
}

/// Everything reported for one path, reduced to what classification needs.
#[derive(Debug, Default)]
struct AccessGroup {
    strongest: Option<AccessKind>,
    written: bool,
    existed: bool,
    pattern: Option<String>,
}

impl AccessGroup {
    fn apply(&mut self, report: AccessReport) {
        if report.kind == AccessKind::Write {
            self.written = true;
            return;
        }
        if self
            .strongest
            .map_or(true, |current| report.kind.severity() > current.severity())
        {
            self.strongest = Some(report.kind);
        }
        if report.kind == AccessKind::Enumerate {
            self.pattern = report.enumerate_pattern;
        }
        self.existed = report.existed;
    }
}

enum Admission {
    Admitted,
    Rejected,
    Outside,
}

/// Reconciles a pip's access reports with its declarations.
pub struct ObservedInputProcessor<'a> {
    graph: &'a PipGraph,
    content: &'a FileContentTable,
    policy: &'a ObservationPolicy,
}

impl<'a> ObservedInputProcessor<'a> {
    pub fn new(
        graph: &'a PipGraph,
        content: &'a FileContentTable,
        policy: &'a ObservationPolicy,
    ) -> Self {
        Self {
            graph,
            content,
            policy,
        }
    }

    /// Classify `reports` for one execution attempt of `pip`.
    ///
    /// A path the pip wrote is treated as a write even if it was first enumerated or probed
    /// while absent. That reclassification depends on the timing of the reports and is best
    /// effort.
    pub fn process(&self, pip: &Pip, mut reports: Vec<AccessReport>) -> ObservedInputResult {
        let table = self.graph.path_table();
        let fs = self.content.file_system();

        reports.sort_by_key(|report| report.timestamp);
        let mut groups: BTreeMap<AbsolutePath, AccessGroup> = BTreeMap::new();
        for report in reports {
            groups.entry(report.path).or_default().apply(report);
        }

        let mut entries: Vec<ObservedPathEntry> = Vec::new();
        let mut violations: Vec<Violation> = Vec::new();
        let mut mismatched = false;

        for (&path, group) in &groups {
            // Unmounted paths are outside the build's view.
            let Some(mount) = self.graph.mounts().resolve(table, path) else {
                continue;
            };

            if group.written {
                if mount.policy.trackable && !self.write_declared(pip, path) {
                    self.violation(&mut violations, pip, ViolationKind::UndeclaredWrite, path);
                }
                continue;
            }
            let Some(kind) = group.strongest else {
                continue;
            };

            if !mount.policy.trackable {
                tracing::warn!(
                    target = "weft.fingerprint",
                    pip = %pip.id,
                    path = %table.display(path),
                    mount = %mount.name,
                    "pip accessed a path under an untrackable mount"
                );
                return ObservedInputResult::aborted(
                    FingerprintError::UntrackableMount {
                        path: table.expand(path).to_string(),
                        mount: mount.name.clone(),
                    },
                    violations,
                );
            }

            if pip.declares_input(path)
                || path == pip.executable
                || pip.output_directory_containing(table, path).is_some()
            {
                continue;
            }

            let text = table.expand(path);
            let is_directory = group.existed && fs.is_directory(Path::new(&*text));
            let entry = match kind {
                AccessKind::Enumerate => {
                    ObservedPathEntry::enumeration(path, group.pattern.clone())
                }
                AccessKind::Probe => ObservedPathEntry::probe(path, is_directory),
                AccessKind::Read if is_directory => ObservedPathEntry::probe(path, true),
                AccessKind::Read | AccessKind::Write => ObservedPathEntry::read(path),
            };

            let admitted = match self.seal_admission(pip, path) {
                Admission::Admitted => true,
                Admission::Rejected if group.existed => {
                    mismatched = true;
                    self.violation(&mut violations, pip, ViolationKind::SealMismatch, path);
                    false
                }
                Admission::Rejected => true,
                Admission::Outside => {
                    if !group.existed || kind == AccessKind::Enumerate || is_directory {
                        true
                    } else if pip.options.allow_undeclared_source_reads && mount.policy.read_only
                    {
                        true
                    } else {
                        self.violation(&mut violations, pip, ViolationKind::UndeclaredRead, path);
                        false
                    }
                }
            };
            if !admitted {
                continue;
            }
            entries.push(entry);

            if !group.existed {
                // Creating any missing ancestor must also invalidate the probe.
                for ancestor in table.ancestors(path) {
                    if !table.is_within(ancestor, mount.root) {
                        break;
                    }
                    let text = table.expand(ancestor);
                    if fs.exists(Path::new(&*text)) {
                        break;
                    }
                    entries.push(ObservedPathEntry::probe(ancestor, true));
                }
            }
        }

        let path_set = ObservedPathSet::new(table, entries);
        match self.evaluate_path_set(pip, &path_set) {
            Ok(observed_inputs) => ObservedInputResult {
                status: if mismatched {
                    ObservedInputStatus::Mismatched
                } else {
                    ObservedInputStatus::Normal
                },
                path_set,
                observed_inputs,
                violations,
                abort: None,
            },
            Err(err) => {
                tracing::warn!(
                    target = "weft.fingerprint",
                    pip = %pip.id,
                    error = %err,
                    "observed input processing aborted"
                );
                ObservedInputResult::aborted(err, violations)
            }
        }
    }

    /// Resolve every entry of `path_set` against the current file system.
    ///
    /// Used both right after execution and when checking a stored path set during cache
    /// lookup, so both sides of a strong-fingerprint comparison are computed the same way.
    pub fn evaluate_path_set(
        &self,
        pip: &Pip,
        path_set: &ObservedPathSet,
    ) -> Result<Vec<ObservedInput>, FingerprintError> {
        let table = self.graph.path_table();
        let fs = self.content.file_system();
        let fingerprinter = DirectoryMembershipFingerprinter::new(self.graph, fs.as_ref());
        let search_path = self
            .policy
            .is_search_path_tool(&table.file_name(pip.executable));

        let mut inputs = Vec::with_capacity(path_set.len());
        for entry in path_set.entries() {
            let mount = self.graph.mounts().resolve(table, entry.path);
            if let Some(mount) = mount.filter(|mount| !mount.policy.trackable) {
                return Err(FingerprintError::UntrackableMount {
                    path: table.expand(entry.path).to_string(),
                    mount: mount.name.clone(),
                });
            }

            let text = table.expand(entry.path);
            let path = Path::new(&*text);
            let kind = if entry.flags.is_enumeration {
                let pattern = EnumerationPattern::new(entry.enumerate_pattern.as_deref())?;
                let mount_kind = mount.map_or(MountKind::ReadOnly, |mount| mount.policy.kind());
                let consumed: Option<BTreeSet<AbsolutePath>> = search_path.then(|| {
                    path_set
                        .entries()
                        .iter()
                        .filter(|other| {
                            !other.flags.is_enumeration
                                && table.parent(other.path) == Some(entry.path)
                        })
                        .map(|other| other.path)
                        .collect()
                });
                let membership = fingerprinter.fingerprint(
                    self.directory_artifact(pip, entry.path),
                    &pattern,
                    mount_kind,
                    consumed.as_ref(),
                )?;
                ObservedInputKind::DirectoryEnumeration(membership.fingerprint)
            } else if !fs.exists(path) {
                ObservedInputKind::AbsentPath
            } else if fs.is_directory(path) {
                ObservedInputKind::ExistingDirectoryProbe
            } else if entry.flags.is_file_probe && mount.map_or(true, |m| m.policy.read_only) {
                ObservedInputKind::ExistingFileProbe
            } else {
                // Files on read/write mounts are rewritten in place, so a probe there is
                // pinned to the bytes it found.
                ObservedInputKind::FileContent(self.content.hash_path(self.graph, entry.path)?)
            };
            inputs.push(ObservedInput {
                entry: entry.clone(),
                kind,
            });
        }
        Ok(inputs)
    }

    fn write_declared(&self, pip: &Pip, path: AbsolutePath) -> bool {
        let table = self.graph.path_table();
        pip.declares_output(path)
            || pip.output_directory_containing(table, path).is_some()
            // Creating the parent directories of declared outputs.
            || pip.outputs.iter().any(|output| table.is_within(output.path, path))
    }

    fn seal_admission(&self, pip: &Pip, path: AbsolutePath) -> Admission {
        let table = self.graph.path_table();
        let mut rejected = false;
        for dir in &pip.input_directories {
            if !dir.is_sealed() {
                if table.is_within(path, dir.path) {
                    return Admission::Admitted;
                }
                continue;
            }
            let Some(seal) = self.graph.seal(dir.seal_id) else {
                continue;
            };
            match seal.membership(table, path) {
                SealMembership::Member => return Admission::Admitted,
                SealMembership::NotMember => rejected = true,
                SealMembership::Outside => {}
            }
        }
        if rejected {
            Admission::Rejected
        } else {
            Admission::Outside
        }
    }

    /// The directory artifact an enumeration of `path` is resolved against.
    fn directory_artifact(&self, pip: &Pip, path: AbsolutePath) -> DirectoryArtifact {
        let table = self.graph.path_table();
        pip.input_directories
            .iter()
            .filter(|dir| dir.is_sealed())
            .find(|dir| {
                self.graph
                    .seal(dir.seal_id)
                    .is_some_and(|seal| seal.membership(table, path) == SealMembership::Member)
            })
            .map(|dir| DirectoryArtifact {
                path,
                seal_id: dir.seal_id,
            })
            .unwrap_or_else(|| DirectoryArtifact::unsealed(path))
    }

    fn violation(
        &self,
        violations: &mut Vec<Violation>,
        pip: &Pip,
        kind: ViolationKind,
        path: AbsolutePath,
    ) {
        tracing::debug!(
            target = "weft.fingerprint",
            pip = %pip.id,
            kind = ?kind,
            path = %self.graph.path_table().display(path),
            "file access violation"
        );
        violations.push(Violation { kind, path });
    }
}
