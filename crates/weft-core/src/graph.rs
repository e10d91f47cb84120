use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::artifact::{DirectoryArtifact, FileArtifact, PipId, SealId};
use crate::mount::{Mount, MountTable};
use crate::path::{AbsolutePath, PathTable};
use crate::pip::Pip;
use crate::seal::{SealDirectory, SealKind};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("pip {pip} ({description}) is declared twice")]
    DuplicatePip { pip: PipId, description: String },

    #[error("{path} (rewrite {rewrite_count}) is produced by both {first} and {second}")]
    DuplicateProducer {
        path: String,
        rewrite_count: u32,
        first: PipId,
        second: PipId,
    },

    #[error("pip {pip} consumes {path} (rewrite {rewrite_count}) but no pip produces it")]
    MissingProducer {
        pip: PipId,
        path: String,
        rewrite_count: u32,
    },

    #[error("pip {pip} rewrites {path} to version {rewrite_count} without consuming version {expected}")]
    RewriteGap {
        pip: PipId,
        path: String,
        rewrite_count: u32,
        expected: u32,
    },

    #[error("pip {pip} references unknown seal {seal:?}")]
    UnknownSeal { pip: PipId, seal: SealId },

    #[error("dependency cycle through pips {pips:?}")]
    Cycle { pips: Vec<PipId> },
}

/// Mutable stage used by graph providers; [`PipGraphBuilder::build`] freezes it.
pub struct PipGraphBuilder {
    path_table: Arc<PathTable>,
    mounts: MountTable,
    pips: Vec<Pip>,
    index: HashMap<PipId, usize>,
    seals: Vec<SealDirectory>,
    producers: HashMap<FileArtifact, PipId>,
    opaque_by_path: HashMap<AbsolutePath, DirectoryArtifact>,
}

impl PipGraphBuilder {
    pub fn new(path_table: Arc<PathTable>) -> Self {
        Self {
            path_table,
            mounts: MountTable::new(),
            pips: Vec::new(),
            index: HashMap::new(),
            seals: Vec::new(),
            producers: HashMap::new(),
            opaque_by_path: HashMap::new(),
        }
    }

    pub fn path_table(&self) -> &Arc<PathTable> {
        &self.path_table
    }

    pub fn add_mount(&mut self, mount: Mount) {
        self.mounts.add(mount);
    }

    /// Seal a source or partial directory. Partial member lists are sorted and deduplicated.
    pub fn seal_directory(&mut self, root: AbsolutePath, kind: SealKind) -> DirectoryArtifact {
        let kind = match kind {
            SealKind::Partial { mut members } => {
                members.sort();
                members.dedup();
                SealKind::Partial { members }
            }
            other => other,
        };
        self.push_seal(root, kind, None)
    }

    fn push_seal(
        &mut self,
        root: AbsolutePath,
        kind: SealKind,
        producer: Option<PipId>,
    ) -> DirectoryArtifact {
        let seal = SealDirectory {
            id: SealId::from_raw(self.seals.len() as u32 + 1),
            root,
            kind,
            producer,
        };
        let artifact = seal.artifact();
        self.seals.push(seal);
        artifact
    }

    /// Sealed artifact for an opaque output directory declared by an already added pip.
    pub fn opaque_directory(&self, path: AbsolutePath) -> Option<DirectoryArtifact> {
        self.opaque_by_path.get(&path).copied()
    }

    pub fn add_pip(&mut self, mut pip: Pip) -> Result<PipId, GraphError> {
        if self.index.contains_key(&pip.id) {
            return Err(GraphError::DuplicatePip {
                pip: pip.id,
                description: pip.description,
            });
        }

        for output in &pip.outputs {
            if let Some(&first) = self.producers.get(output) {
                return Err(GraphError::DuplicateProducer {
                    path: self.path_table.expand(output.path).to_string(),
                    rewrite_count: output.rewrite_count,
                    first,
                    second: pip.id,
                });
            }
        }
        for output in &pip.outputs {
            self.producers.insert(*output, pip.id);
        }

        let mut sealed_outputs = Vec::with_capacity(pip.output_directories.len());
        for dir in &pip.output_directories {
            let artifact = self.push_seal(dir.path, SealKind::Opaque, Some(pip.id));
            self.opaque_by_path.insert(dir.path, artifact);
            sealed_outputs.push(artifact);
        }
        pip.output_directories = sealed_outputs;

        let id = pip.id;
        self.index.insert(id, self.pips.len());
        self.pips.push(pip);
        Ok(id)
    }

    pub fn build(self) -> Result<PipGraph, GraphError> {
        let count = self.pips.len();
        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];

        let producer_index = |artifact: &FileArtifact| {
            self.producers
                .get(artifact)
                .and_then(|id| self.index.get(id).copied())
        };

        for (idx, pip) in self.pips.iter().enumerate() {
            for input in pip.inputs.iter().filter(|input| input.is_output()) {
                let Some(producer) = producer_index(input) else {
                    return Err(GraphError::MissingProducer {
                        pip: pip.id,
                        path: self.path_table.expand(input.path).to_string(),
                        rewrite_count: input.rewrite_count,
                    });
                };
                dependencies[idx].insert(producer);
            }

            for output in &pip.outputs {
                let Some(previous) = output.previous_rewrite() else {
                    continue;
                };
                if !pip.inputs.contains(&previous) {
                    return Err(GraphError::RewriteGap {
                        pip: pip.id,
                        path: self.path_table.expand(output.path).to_string(),
                        rewrite_count: output.rewrite_count,
                        expected: previous.rewrite_count,
                    });
                }
            }

            for dir in pip.input_directories.iter().filter(|dir| dir.is_sealed()) {
                let Some(seal) = self.seals.get(dir.seal_id.to_raw() as usize - 1) else {
                    return Err(GraphError::UnknownSeal {
                        pip: pip.id,
                        seal: dir.seal_id,
                    });
                };
                if let Some(producer) = seal.producer.and_then(|id| self.index.get(&id).copied())
                {
                    dependencies[idx].insert(producer);
                }
                for member in seal.members().iter().filter(|member| member.is_output()) {
                    let Some(producer) = producer_index(member) else {
                        return Err(GraphError::MissingProducer {
                            pip: pip.id,
                            path: self.path_table.expand(member.path).to_string(),
                            rewrite_count: member.rewrite_count,
                        });
                    };
                    dependencies[idx].insert(producer);
                }
            }

            dependencies[idx].remove(&idx);
        }

        // A reader pinned to version N must finish before anything rewrites the file to N+1.
        for (idx, pip) in self.pips.iter().enumerate() {
            let sealed_members = pip
                .input_directories
                .iter()
                .filter(|dir| dir.is_sealed())
                .filter_map(|dir| self.seals.get(dir.seal_id.to_raw() as usize - 1))
                .flat_map(|seal| seal.members().iter());
            for consumed in pip.inputs.iter().chain(sealed_members) {
                if !consumed.is_output() {
                    continue;
                }
                if let Some(rewriter) = producer_index(&consumed.next_rewrite()) {
                    if rewriter != idx {
                        dependencies[rewriter].insert(idx);
                    }
                }
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (idx, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        let topological_order = topological_sort(&dependencies, &dependents).map_err(|stuck| {
            GraphError::Cycle {
                pips: stuck.into_iter().map(|idx| self.pips[idx].id).collect(),
            }
        })?;

        let mut latest_rewrite: HashMap<AbsolutePath, u32> = HashMap::new();
        for artifact in self.producers.keys() {
            let entry = latest_rewrite.entry(artifact.path).or_default();
            *entry = (*entry).max(artifact.rewrite_count);
        }

        let mut known_children: HashMap<AbsolutePath, BTreeSet<(AbsolutePath, bool)>> =
            HashMap::new();
        let table = &self.path_table;
        let mut register = |path: AbsolutePath, is_directory: bool| {
            let mut child = (path, is_directory);
            while let Some(parent) = table.parent(child.0) {
                let inserted = known_children.entry(parent).or_default().insert(child);
                if !inserted {
                    break;
                }
                child = (parent, true);
            }
        };
        for artifact in self.producers.keys() {
            register(artifact.path, false);
        }
        for dir in self.opaque_by_path.keys() {
            register(*dir, true);
        }
        let mut known_directories: HashSet<AbsolutePath> = known_children.keys().copied().collect();
        known_directories.extend(self.opaque_by_path.keys().copied());

        tracing::debug!(
            target = "weft.core",
            pips = count,
            seals = self.seals.len(),
            "pip graph built"
        );

        Ok(PipGraph {
            path_table: self.path_table,
            mounts: self.mounts,
            pips: self.pips,
            index: self.index,
            dependencies: dependencies
                .into_iter()
                .map(|deps| deps.into_iter().collect())
                .collect(),
            dependents,
            seals: self.seals,
            producers: self.producers,
            latest_rewrite,
            topological_order,
            known_children,
            known_directories,
        })
    }
}

/// Kahn's algorithm; ties resolve in declaration order. On a cycle, returns the pips that
/// could not be ordered.
fn topological_sort(
    dependencies: &[BTreeSet<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut remaining: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut queue: VecDeque<usize> = remaining
        .iter()
        .enumerate()
        .filter(|(_, &n)| n == 0)
        .map(|(idx, _)| idx)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() == dependencies.len() {
        Ok(order)
    } else {
        Err(remaining
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(idx, _)| idx)
            .collect())
    }
}

/// Immutable snapshot of pips, artifacts, seals and mounts for one build.
#[derive(Debug)]
pub struct PipGraph {
    path_table: Arc<PathTable>,
    mounts: MountTable,
    pips: Vec<Pip>,
    index: HashMap<PipId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    seals: Vec<SealDirectory>,
    producers: HashMap<FileArtifact, PipId>,
    latest_rewrite: HashMap<AbsolutePath, u32>,
    topological_order: Vec<usize>,
    known_children: HashMap<AbsolutePath, BTreeSet<(AbsolutePath, bool)>>,
    known_directories: HashSet<AbsolutePath>,
}

impl PipGraph {
    pub fn path_table(&self) -> &Arc<PathTable> {
        &self.path_table
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn len(&self) -> usize {
        self.pips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pips.is_empty()
    }

    /// Pips in declaration order.
    pub fn pips(&self) -> impl Iterator<Item = &Pip> {
        self.pips.iter()
    }

    pub fn pip(&self, id: PipId) -> Option<&Pip> {
        self.index.get(&id).map(|&idx| &self.pips[idx])
    }

    pub fn dependencies(&self, id: PipId) -> Vec<PipId> {
        self.neighbours(id, &self.dependencies)
    }

    pub fn dependents(&self, id: PipId) -> Vec<PipId> {
        self.neighbours(id, &self.dependents)
    }

    fn neighbours(&self, id: PipId, edges: &[Vec<usize>]) -> Vec<PipId> {
        self.index
            .get(&id)
            .map(|&idx| edges[idx].iter().map(|&n| self.pips[n].id).collect())
            .unwrap_or_default()
    }

    pub fn topological_order(&self) -> Vec<PipId> {
        self.topological_order
            .iter()
            .map(|&idx| self.pips[idx].id)
            .collect()
    }

    /// Position of the pip in topological order; used to prioritise ready work.
    pub fn priority(&self, id: PipId) -> usize {
        self.index
            .get(&id)
            .and_then(|idx| self.topological_order.iter().position(|n| n == idx))
            .unwrap_or(usize::MAX)
    }

    pub fn seal(&self, id: SealId) -> Option<&SealDirectory> {
        if !id.is_sealed() {
            return None;
        }
        self.seals.get(id.to_raw() as usize - 1)
    }

    pub fn seals(&self) -> &[SealDirectory] {
        &self.seals
    }

    pub fn producer(&self, artifact: FileArtifact) -> Option<PipId> {
        self.producers.get(&artifact).copied()
    }

    /// The live version of `path`: the highest rewrite any pip produces, or the source file.
    pub fn latest_rewrite(&self, path: AbsolutePath) -> FileArtifact {
        FileArtifact {
            path,
            rewrite_count: self.latest_rewrite.get(&path).copied().unwrap_or(0),
        }
    }

    /// Direct children of `directory` the graph knows will exist: declared outputs, opaque
    /// output directories, and the directories leading to them. `bool` marks directories.
    pub fn known_members(&self, directory: AbsolutePath) -> Vec<(AbsolutePath, bool)> {
        self.known_children
            .get(&directory)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the graph expects `path` to exist as a directory once its producers ran.
    pub fn is_known_directory(&self, path: AbsolutePath) -> bool {
        self.known_directories.contains(&path)
    }
}
