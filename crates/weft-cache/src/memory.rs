use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use weft_fingerprint::{ContentHash, SerializedPathSet, StrongFingerprint, WeakFingerprint};

use crate::backend::{CacheBackend, ContentStore};
use crate::entry::{CacheEntry, PublishedEntry, PutOutcome};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Stored {
    strong: StrongFingerprint,
    path_set: SerializedPathSet,
    entry: CacheEntry,
}

/// Process-local cache backend and content store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<WeakFingerprint, Vec<Stored>>>,
    blobs: Mutex<HashMap<ContentHash, Arc<[u8]>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `(weak, strong)` entries.
    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().values().map(Vec::len).sum()
    }

    pub fn blob_count(&self) -> usize {
        self.inner.blobs.lock().len()
    }

    /// Overwrite a stored blob without re-hashing; lets tests simulate store corruption.
    pub fn corrupt_blob(&self, hash: ContentHash, bytes: &[u8]) {
        self.inner.blobs.lock().insert(hash, Arc::from(bytes));
    }
}

impl CacheBackend for InMemoryCache {
    fn try_get_entries(&self, weak: WeakFingerprint) -> Result<Vec<PublishedEntry>> {
        Ok(self
            .inner
            .entries
            .lock()
            .get(&weak)
            .map(|stored| {
                stored
                    .iter()
                    .map(|stored| PublishedEntry {
                        path_set: stored.path_set.clone(),
                        strong: stored.strong,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get(&self, weak: WeakFingerprint, strong: StrongFingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.inner.entries.lock().get(&weak).and_then(|stored| {
            stored
                .iter()
                .find(|stored| stored.strong == strong)
                .map(|stored| stored.entry.clone())
        }))
    }

    fn put(
        &self,
        weak: WeakFingerprint,
        strong: StrongFingerprint,
        path_set: &SerializedPathSet,
        entry: &CacheEntry,
    ) -> Result<PutOutcome> {
        let mut entries = self.inner.entries.lock();
        let stored = entries.entry(weak).or_default();
        if let Some(existing) = stored.iter().find(|stored| stored.strong == strong) {
            if existing.entry == *entry {
                return Ok(PutOutcome::Stored);
            }
            return Ok(PutOutcome::Conflict {
                existing: existing.entry.clone(),
            });
        }
        stored.push(Stored {
            strong,
            path_set: path_set.clone(),
            entry: entry.clone(),
        });
        Ok(PutOutcome::Stored)
    }
}

impl ContentStore for InMemoryCache {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        let mut blobs = self.inner.blobs.lock();
        let intact = blobs
            .get(&hash)
            .is_some_and(|existing| ContentHash::of(&existing[..]) == hash);
        if !intact {
            blobs.insert(hash, Arc::from(bytes));
        }
        Ok(hash)
    }

    fn get(&self, hash: ContentHash) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.blobs.lock().get(&hash).map(|bytes| bytes.to_vec()))
    }

    fn contains(&self, hash: ContentHash) -> Result<bool> {
        Ok(self.inner.blobs.lock().contains_key(&hash))
    }
}
