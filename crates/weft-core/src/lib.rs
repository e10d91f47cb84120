//! Core data model for weft builds: interned paths, file and directory artifacts, mounts,
//! sealed directories, pips and the immutable pip graph.
//!
//! Everything here is plain data. Hashing lives in `weft-fingerprint`, execution in
//! `weft-scheduler`.

mod artifact;
mod graph;
mod mount;
mod path;
mod pip;
mod seal;

pub use artifact::{DirectoryArtifact, FileArtifact, PipId, SealId};
pub use graph::{GraphError, PipGraph, PipGraphBuilder};
pub use mount::{Mount, MountKind, MountPolicy, MountTable};
pub use path::{AbsolutePath, PathDisplay, PathError, PathTable, PathTableSnapshot};
pub use pip::{Pip, PipBuilder, PipOptions};
pub use seal::{SealDirectory, SealKind, SealMembership};
