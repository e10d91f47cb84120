//! Cache client contract for weft: the fingerprint store keyed by `(weak, strong)` and the
//! content-addressed blob store, with in-memory and local-disk implementations.

mod backend;
mod disk;
mod entry;
mod error;
mod memory;

pub use backend::{CacheBackend, ContentStore};
pub use disk::{LocalDiskCache, CACHE_SCHEMA_VERSION};
pub use entry::{CacheEntry, CachedOutput, PublishedEntry, PutOutcome};
pub use error::{CacheError, Result};
pub use memory::InMemoryCache;
