use weft_cache::{
    CacheBackend, CacheEntry, CacheError, CachedOutput, ContentStore, LocalDiskCache, PutOutcome,
};
use weft_fingerprint::{
    ContentHash, ObservedPathEntryFlags, SerializedPathEntry, SerializedPathSet,
    StrongFingerprint, WeakFingerprint,
};

fn path_set() -> SerializedPathSet {
    SerializedPathSet {
        entries: vec![SerializedPathEntry {
            path: "/repo/src/optional.h".into(),
            flags: ObservedPathEntryFlags {
                is_file_probe: true,
                ..ObservedPathEntryFlags::default()
            },
            pattern: None,
        }],
    }
}

fn entry(content: ContentHash) -> CacheEntry {
    CacheEntry {
        outputs: vec![CachedOutput {
            path: "/repo/out/a.o".into(),
            rewrite_count: 1,
            content,
        }],
        exit_code: 0,
        ..CacheEntry::default()
    }
}

#[test]
fn entries_survive_reopening_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let weak = WeakFingerprint::from_digest([3; 32]);
    let first = StrongFingerprint::from_digest([4; 32]);
    let second = StrongFingerprint::from_digest([5; 32]);

    {
        let cache = LocalDiskCache::open(dir.path()).unwrap();
        let hash = ContentStore::put(&cache, b"object bytes").unwrap();
        assert_eq!(
            CacheBackend::put(&cache, weak, first, &path_set(), &entry(hash)).unwrap(),
            PutOutcome::Stored
        );
        assert_eq!(
            CacheBackend::put(&cache, weak, second, &SerializedPathSet::default(), &entry(hash))
                .unwrap(),
            PutOutcome::Stored
        );
    }

    let cache = LocalDiskCache::open(dir.path()).unwrap();
    let published = cache.try_get_entries(weak).unwrap();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].strong, first);
    assert_eq!(published[0].path_set, path_set());

    let stored = CacheBackend::get(&cache, weak, first).unwrap().unwrap();
    let bytes = ContentStore::get(&cache, stored.outputs[0].content)
        .unwrap()
        .unwrap();
    assert_eq!(bytes, b"object bytes");
    assert!(cache
        .try_get_entries(WeakFingerprint::from_digest([9; 32]))
        .unwrap()
        .is_empty());
}

#[test]
fn differing_entry_under_same_key_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocalDiskCache::open(dir.path()).unwrap();
    let weak = WeakFingerprint::from_digest([1; 32]);
    let strong = StrongFingerprint::from_digest([2; 32]);

    let original = entry(ContentHash::of(b"a"));
    CacheBackend::put(&cache, weak, strong, &path_set(), &original).unwrap();
    let outcome =
        CacheBackend::put(&cache, weak, strong, &path_set(), &entry(ContentHash::of(b"b"))).unwrap();
    assert_eq!(outcome, PutOutcome::Conflict { existing: original.clone() });
    assert_eq!(CacheBackend::get(&cache, weak, strong).unwrap(), Some(original));
}

#[test]
fn schema_mismatch_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocalDiskCache::open(dir.path()).unwrap();
    let weak = WeakFingerprint::from_digest([7; 32]);
    std::fs::write(
        dir.path().join("entries").join(format!("{weak}.json")),
        br#"{"schema_version": 99, "entries": []}"#,
    )
    .unwrap();

    let err = cache.try_get_entries(weak).unwrap_err();
    assert!(matches!(
        err,
        CacheError::IncompatibleSchemaVersion {
            expected: 1,
            found: 99
        }
    ));
}

#[test]
fn missing_blob_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocalDiskCache::open(dir.path()).unwrap();
    let hash = ContentHash::of(b"never stored");
    assert_eq!(ContentStore::get(&cache, hash).unwrap(), None);
    assert!(!cache.contains(hash).unwrap());
}

#[test]
fn corrupt_blob_is_replaced_when_put_again() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocalDiskCache::open(dir.path()).unwrap();
    let hash = ContentStore::put(&cache, b"object code").unwrap();

    let hex = hash.to_hex();
    let blob = dir.path().join("blobs").join(&hex[..2]).join(&hex);
    std::fs::write(&blob, b"bit rot").unwrap();

    assert_eq!(ContentStore::put(&cache, b"object code").unwrap(), hash);
    assert_eq!(
        ContentStore::get(&cache, hash).unwrap(),
        Some(b"object code".to_vec())
    );
}
