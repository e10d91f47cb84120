use weft_fingerprint::{ContentHash, SerializedPathSet, StrongFingerprint, WeakFingerprint};

use crate::entry::{CacheEntry, PublishedEntry, PutOutcome};
use crate::error::Result;

/// Fingerprint store keyed by `(weak, strong)`.
pub trait CacheBackend: Send + Sync {
    /// Every strong fingerprint published under `weak`, oldest first.
    fn try_get_entries(&self, weak: WeakFingerprint) -> Result<Vec<PublishedEntry>>;

    fn get(&self, weak: WeakFingerprint, strong: StrongFingerprint) -> Result<Option<CacheEntry>>;

    /// Publish an entry. Implementations must report [`PutOutcome::Conflict`] instead of
    /// replacing a different entry stored under the same key.
    fn put(
        &self,
        weak: WeakFingerprint,
        strong: StrongFingerprint,
        path_set: &SerializedPathSet,
        entry: &CacheEntry,
    ) -> Result<PutOutcome>;
}

/// Content-addressed blob store for output bytes.
pub trait ContentStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash>;

    fn get(&self, hash: ContentHash) -> Result<Option<Vec<u8>>>;

    fn contains(&self, hash: ContentHash) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }
}
