use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use weft_fingerprint::{
    atomic_write, ContentHash, SerializedPathSet, StrongFingerprint, WeakFingerprint,
};

use crate::backend::{CacheBackend, ContentStore};
use crate::entry::{CacheEntry, PublishedEntry, PutOutcome};
use crate::error::{CacheError, Result};

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EntriesFile {
    schema_version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    strong: StrongFingerprint,
    path_set: SerializedPathSet,
    entry: CacheEntry,
}

/// Cache backend and content store persisted under one directory.
///
/// Layout:
/// - `entries/<weak>.json`: every `(strong, path set, entry)` published under `weak`
/// - `blobs/<first two hex digits>/<hash>`: output bytes
///
/// Files are replaced atomically; a process-local lock serialises read-modify-write of entry
/// files.
#[derive(Debug)]
pub struct LocalDiskCache {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalDiskCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["entries", "blobs"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|err| CacheError::io(&dir, err))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries_path(&self, weak: WeakFingerprint) -> PathBuf {
        self.root.join("entries").join(format!("{weak}.json"))
    }

    fn blob_path(&self, hash: ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join("blobs").join(&hex[..2]).join(hex)
    }

    fn load(&self, weak: WeakFingerprint) -> Result<Vec<StoredEntry>> {
        let path = self.entries_path(weak);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(path, err)),
        };
        let file: EntriesFile = serde_json::from_slice(&bytes)?;
        if file.schema_version != CACHE_SCHEMA_VERSION {
            return Err(CacheError::IncompatibleSchemaVersion {
                expected: CACHE_SCHEMA_VERSION,
                found: file.schema_version,
            });
        }
        Ok(file.entries)
    }
}

impl CacheBackend for LocalDiskCache {
    fn try_get_entries(&self, weak: WeakFingerprint) -> Result<Vec<PublishedEntry>> {
        Ok(self
            .load(weak)?
            .into_iter()
            .map(|stored| PublishedEntry {
                path_set: stored.path_set,
                strong: stored.strong,
            })
            .collect())
    }

    fn get(&self, weak: WeakFingerprint, strong: StrongFingerprint) -> Result<Option<CacheEntry>> {
        Ok(self
            .load(weak)?
            .into_iter()
            .find(|stored| stored.strong == strong)
            .map(|stored| stored.entry))
    }

    fn put(
        &self,
        weak: WeakFingerprint,
        strong: StrongFingerprint,
        path_set: &SerializedPathSet,
        entry: &CacheEntry,
    ) -> Result<PutOutcome> {
        let _guard = self.write_lock.lock();
        let mut entries = self.load(weak)?;
        if let Some(existing) = entries.iter().find(|stored| stored.strong == strong) {
            if existing.entry == *entry {
                return Ok(PutOutcome::Stored);
            }
            tracing::warn!(
                target = "weft.cache",
                weak = %weak,
                strong = %strong,
                "refusing to overwrite a different cache entry"
            );
            return Ok(PutOutcome::Conflict {
                existing: existing.entry.clone(),
            });
        }

        entries.push(StoredEntry {
            strong,
            path_set: path_set.clone(),
            entry: entry.clone(),
        });
        let file = EntriesFile {
            schema_version: CACHE_SCHEMA_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let path = self.entries_path(weak);
        atomic_write(&path, &bytes).map_err(|err| CacheError::io(path, err))?;
        tracing::debug!(target = "weft.cache", weak = %weak, strong = %strong, "stored cache entry");
        Ok(PutOutcome::Stored)
    }
}

impl ContentStore for LocalDiskCache {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        let path = self.blob_path(hash);
        match fs::read(&path) {
            Ok(existing) if ContentHash::of(&existing) == hash => return Ok(hash),
            Ok(_) => {
                tracing::warn!(target = "weft.cache", blob = %hash, "replacing corrupt blob");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::io(path, err)),
        }
        atomic_write(&path, bytes).map_err(|err| CacheError::io(&path, err))?;
        Ok(hash)
    }

    fn get(&self, hash: ContentHash) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::io(path, err)),
        }
    }

    fn contains(&self, hash: ContentHash) -> Result<bool> {
        Ok(self.blob_path(hash).is_file())
    }
}
