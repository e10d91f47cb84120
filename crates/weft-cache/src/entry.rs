use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use weft_fingerprint::{ContentHash, SerializedPathSet, StrongFingerprint};

/// One output file recorded by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    pub path: String,
    pub rewrite_count: u32,
    pub content: ContentHash,
}

/// The result of one pip execution as stored under `(weak, strong)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outputs: Vec<CachedOutput>,
    pub exit_code: i32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A strong fingerprint published under a weak fingerprint, with the path set that produced
/// it so lookups can re-evaluate that path set against the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEntry {
    pub path_set: SerializedPathSet,
    pub strong: StrongFingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored, or an identical entry was already present.
    Stored,
    /// A different entry already lives under the same key. Never overwritten.
    Conflict { existing: CacheEntry },
}
