//! Content hashing, weak and strong fingerprints, and reconciliation of observed file
//! accesses against a pip's declarations.

mod content;
mod error;
mod fs;
mod hash;
mod membership;
mod observed;
mod strong;
mod weak;

pub use content::{ensure_trackable, FileContentTable};
pub use error::FingerprintError;
pub use fs::{atomic_write, DirEntry, FileSystemView, RealFileSystem};
pub use hash::{
    ContentHash, FingerprintBuilder, MembershipFingerprint, PathSetHash, StrongFingerprint,
    WeakFingerprint,
};
pub use membership::{DirectoryMembershipFingerprinter, EnumerationPattern, MembershipResult};
pub use observed::{
    AccessKind, AccessReport, ObservationPolicy, ObservedInputProcessor, ObservedInputResult,
    ObservedInputStatus, Violation, ViolationKind,
};
pub use strong::{
    compute_path_set_hash, compute_strong_fingerprint, ObservedInput, ObservedInputKind,
    ObservedPathEntry, ObservedPathEntryFlags, ObservedPathSet, SerializedPathEntry,
    SerializedPathSet,
};
pub use weak::{compute_weak_fingerprint, seal_token};
