//! Blocking per-pip phases: fingerprinting, cache lookup, replay, and post-execution
//! analysis. Callers run these on the blocking pool.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use weft_cache::{CacheBackend, CacheEntry, CachedOutput, ContentStore, PutOutcome};
use weft_core::{AbsolutePath, FileArtifact, Pip, PipGraph};
use weft_fingerprint::{
    compute_path_set_hash, compute_strong_fingerprint, compute_weak_fingerprint, AccessReport,
    ContentHash, FileContentTable, FileSystemView, ObservationPolicy, ObservedInputProcessor,
    ObservedPathSet, SerializedPathSet, StrongFingerprint, WeakFingerprint,
};

use crate::error::PipFailure;

/// A stored entry whose path set still evaluates to its strong fingerprint.
#[derive(Debug, Clone)]
pub(crate) struct CacheHit {
    pub strong: StrongFingerprint,
    pub entry: CacheEntry,
}

#[derive(Debug)]
pub(crate) enum Replay {
    /// Every output is on disk with the cached bytes. `written` counts files rewritten and
    /// `removed` stale files deleted from opaque directories.
    Restored { written: u64, removed: u64 },
    /// The entry cannot be materialized; execute instead.
    Unusable(String),
}

/// What a successful execution produced.
#[derive(Debug)]
pub(crate) struct Analysis {
    pub outputs: Vec<CachedOutput>,
    /// `None` when the execution may not be cached.
    pub publication: Option<Publication>,
}

#[derive(Debug)]
pub(crate) struct Publication {
    pub strong: StrongFingerprint,
    pub path_set: SerializedPathSet,
}

pub(crate) struct Engine {
    graph: Arc<PipGraph>,
    content: FileContentTable,
    cache: Arc<dyn CacheBackend>,
    store: Arc<dyn ContentStore>,
    policy: ObservationPolicy,
    salt: String,
}

impl Engine {
    pub fn new(
        graph: Arc<PipGraph>,
        fs: Arc<dyn FileSystemView>,
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn ContentStore>,
        policy: ObservationPolicy,
        salt: String,
    ) -> Self {
        Self {
            graph,
            content: FileContentTable::new(fs),
            cache,
            store,
            policy,
            salt,
        }
    }

    fn fs(&self) -> &dyn FileSystemView {
        self.content.file_system().as_ref()
    }

    pub fn weak_fingerprint(&self, pip: &Pip) -> Result<WeakFingerprint, PipFailure> {
        compute_weak_fingerprint(pip, &self.graph, &self.content, &self.salt)
            .map_err(|err| PipFailure::from_fingerprint(pip.id, err))
    }

    /// Find a stored entry whose path set, re-evaluated now, yields its recorded strong
    /// fingerprint. Backend errors and undecodable entries count as misses.
    pub fn lookup(&self, pip: &Pip, weak: WeakFingerprint) -> Option<CacheHit> {
        let table = self.graph.path_table();
        let published = match self.cache.try_get_entries(weak) {
            Ok(published) => published,
            Err(err) => {
                tracing::warn!(target = "weft.scheduler", pip = %pip.id, error = %err, "cache lookup failed");
                return None;
            }
        };

        let processor = ObservedInputProcessor::new(&self.graph, &self.content, &self.policy);
        for candidate in published {
            let path_set = match ObservedPathSet::from_serialized(table, &candidate.path_set) {
                Ok(path_set) => path_set,
                Err(err) => {
                    tracing::warn!(target = "weft.scheduler", pip = %pip.id, error = %err, "skipping undecodable path set");
                    continue;
                }
            };
            let inputs = match processor.evaluate_path_set(pip, &path_set) {
                Ok(inputs) => inputs,
                Err(err) => {
                    tracing::warn!(target = "weft.scheduler", pip = %pip.id, error = %err, "skipping path set that no longer evaluates");
                    continue;
                }
            };
            let strong = compute_strong_fingerprint(
                table,
                weak,
                compute_path_set_hash(table, &path_set),
                &inputs,
            );
            if strong != candidate.strong {
                continue;
            }
            match self.cache.get(weak, strong) {
                Ok(Some(entry)) => return Some(CacheHit { strong, entry }),
                Ok(None) => {
                    tracing::debug!(target = "weft.scheduler", pip = %pip.id, %strong, "published strong fingerprint has no entry");
                }
                Err(err) => {
                    tracing::warn!(target = "weft.scheduler", pip = %pip.id, error = %err, "cache get failed");
                }
            }
        }
        None
    }

    /// Restore `entry`'s outputs onto disk.
    ///
    /// Every blob is fetched and verified before anything is written, so an unusable entry
    /// leaves the disk untouched.
    pub fn replay(&self, pip: &Pip, entry: &CacheEntry) -> Result<Replay, PipFailure> {
        let table = self.graph.path_table();
        let mut verified: Vec<(FileArtifact, ContentHash, Vec<u8>)> =
            Vec::with_capacity(entry.outputs.len());
        for output in &entry.outputs {
            let Ok(path) = table.intern(&output.path) else {
                return Ok(Replay::Unusable(format!("invalid output path `{}`", output.path)));
            };
            let bytes = match ContentStore::get(&*self.store, output.content) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    return Ok(Replay::Unusable(format!(
                        "blob {} for `{}` is missing",
                        output.content, output.path
                    )))
                }
                Err(err) => return Ok(Replay::Unusable(err.to_string())),
            };
            if ContentHash::of(&bytes) != output.content {
                tracing::warn!(
                    target = "weft.scheduler",
                    pip = %pip.id,
                    path = %output.path,
                    expected = %output.content,
                    "cached blob does not match its hash"
                );
                return Ok(Replay::Unusable(format!("blob for `{}` is corrupt", output.path)));
            }
            let artifact = FileArtifact {
                path,
                rewrite_count: output.rewrite_count,
            };
            verified.push((artifact, output.content, bytes));
        }

        // Opaque directories hold exactly what the entry recorded.
        let recorded: HashSet<AbsolutePath> =
            verified.iter().map(|(artifact, _, _)| artifact.path).collect();
        let mut removed = 0;
        for dir in &pip.output_directories {
            let mut present = Vec::new();
            self.walk(pip, dir.path, &mut present)?;
            for stale in present.into_iter().filter(|path| !recorded.contains(path)) {
                let text = table.expand(stale);
                self.fs()
                    .remove_file(Path::new(&*text))
                    .map_err(|err| io_failure(pip, &text, &err))?;
                removed += 1;
            }
        }

        let mut written = 0;
        for (artifact, hash, bytes) in verified {
            let text = table.expand(artifact.path);
            let path = Path::new(&*text);
            let current = self.fs().read_file(path).ok().map(ContentHash::of);
            if current != Some(hash) {
                self.fs()
                    .write_file(path, &bytes)
                    .map_err(|err| io_failure(pip, &text, &err))?;
                written += 1;
            }
            self.content.record(artifact, hash);
        }
        Ok(Replay::Restored { written, removed })
    }

    /// Reconcile `reports` with `pip`'s declarations and capture its outputs.
    pub fn analyze(
        &self,
        pip: &Pip,
        weak: WeakFingerprint,
        reports: Vec<AccessReport>,
    ) -> Result<Analysis, PipFailure> {
        let table = self.graph.path_table();
        let processor = ObservedInputProcessor::new(&self.graph, &self.content, &self.policy);
        let mut result = processor.process(pip, reports);
        if let Some(err) = result.abort.take() {
            return Err(PipFailure::from_fingerprint(pip.id, err));
        }
        if !result.violations.is_empty() {
            tracing::warn!(
                target = "weft.scheduler",
                pip = %pip.id,
                violations = result.violations.len(),
                status = ?result.status,
                "pip made undeclared file accesses"
            );
            if self.policy.unexpected_file_accesses_are_errors {
                return Err(PipFailure::from_violations(pip.id, table, &result.violations));
            }
        }

        let mut outputs = Vec::with_capacity(pip.outputs.len());
        for artifact in &pip.outputs {
            outputs.push(self.capture(pip, *artifact)?);
        }
        for dir in &pip.output_directories {
            let mut files = Vec::new();
            self.walk(pip, dir.path, &mut files)?;
            for path in files {
                outputs.push(self.capture(pip, FileArtifact::output(path))?);
            }
        }

        let publication = result.is_cacheable().then(|| Publication {
            strong: compute_strong_fingerprint(
                table,
                weak,
                compute_path_set_hash(table, &result.path_set),
                &result.observed_inputs,
            ),
            path_set: result.path_set.to_serialized(table),
        });
        Ok(Analysis {
            outputs,
            publication,
        })
    }

    /// Store the execution under `(weak, strong)`. Returns whether it was published.
    ///
    /// A conflicting entry is an integrity failure; any other backend error only loses the
    /// cache entry.
    pub fn publish(
        &self,
        pip: &Pip,
        weak: WeakFingerprint,
        publication: &Publication,
        outputs: Vec<CachedOutput>,
        exit_code: i32,
    ) -> Result<bool, PipFailure> {
        let mut metadata = BTreeMap::new();
        metadata.insert("description".to_string(), pip.description.clone());
        let entry = CacheEntry {
            outputs,
            exit_code,
            metadata,
        };
        match self
            .cache
            .put(weak, publication.strong, &publication.path_set, &entry)
        {
            Ok(PutOutcome::Stored) => Ok(true),
            Ok(PutOutcome::Conflict { existing }) => Err(PipFailure::CacheIntegrity {
                pip: pip.id,
                detail: format!(
                    "a different entry ({} outputs, exit code {}) is already stored under strong fingerprint {}",
                    existing.outputs.len(),
                    existing.exit_code,
                    publication.strong
                ),
            }),
            Err(err) => {
                tracing::warn!(target = "weft.scheduler", pip = %pip.id, error = %err, "failed to store cache entry");
                Ok(false)
            }
        }
    }

    fn capture(&self, pip: &Pip, artifact: FileArtifact) -> Result<CachedOutput, PipFailure> {
        let text = self.graph.path_table().expand(artifact.path);
        let bytes = match self.fs().read_file(Path::new(&*text)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PipFailure::MissingOutput {
                    pip: pip.id,
                    path: text.to_string(),
                })
            }
            Err(err) => return Err(io_failure(pip, &text, &err)),
        };
        let content = ContentStore::put(&*self.store, &bytes)
            .map_err(|err| PipFailure::from_cache(pip.id, err))?;
        self.content.record(artifact, content);
        Ok(CachedOutput {
            path: text.to_string(),
            rewrite_count: artifact.rewrite_count,
            content,
        })
    }

    fn walk(
        &self,
        pip: &Pip,
        dir: AbsolutePath,
        files: &mut Vec<AbsolutePath>,
    ) -> Result<(), PipFailure> {
        let table = self.graph.path_table();
        let text = table.expand(dir);
        let path = Path::new(&*text);
        if !self.fs().is_directory(path) {
            return Ok(());
        }
        let entries = self
            .fs()
            .enumerate(path)
            .map_err(|err| io_failure(pip, &text, &err))?;
        for entry in entries {
            let child = table
                .child(dir, &entry.name)
                .map_err(|err| PipFailure::internal(pip.id, err.to_string()))?;
            if entry.is_directory {
                self.walk(pip, child, files)?;
            } else {
                files.push(child);
            }
        }
        Ok(())
    }
}

fn io_failure(pip: &Pip, path: &str, err: &io::Error) -> PipFailure {
    PipFailure::Io {
        pip: pip.id,
        path: path.to_string(),
        message: err.to_string(),
    }
}
