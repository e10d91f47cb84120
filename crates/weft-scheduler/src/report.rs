use std::collections::BTreeMap;

use serde::Serialize;
use weft_core::PipId;

use crate::error::PipFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency failed and the build is not best-effort.
    DependencyFailed,
    /// Cache-only build and no usable cache entry.
    CacheMiss,
    /// The build halted before this pip started.
    BuildHalted,
    /// The pip was cancelled along with the build.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipOutcome {
    Executed {
        /// Whether the result was published to the cache.
        stored: bool,
        exit_code: i32,
        attempts: u32,
        resource_retries: u32,
    },
    CacheHit,
    Failed(PipFailure),
    Skipped { reason: SkipReason },
}

impl PipOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PipOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildCounters {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub executed: u64,
    pub stored: u64,
    /// Executed successfully but not published, e.g. after tolerated file access violations.
    pub uncacheable: u64,
    pub failed: u64,
    pub skipped: u64,
    pub exit_code_retries: u64,
    pub resource_retries: u64,
    /// Output files written back to disk during cache replay.
    pub replayed_files: u64,
}

/// Final result of one build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub outcomes: BTreeMap<PipId, PipOutcome>,
    pub counters: BuildCounters,
    /// The failure that halted the build, if one did.
    pub fatal: Option<PipFailure>,
}

impl BuildReport {
    pub fn outcome(&self, pip: PipId) -> Option<&PipOutcome> {
        self.outcomes.get(&pip)
    }

    pub fn success(&self) -> bool {
        self.fatal.is_none() && !self.outcomes.values().any(PipOutcome::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PipFailure> {
        self.outcomes.values().filter_map(|outcome| match outcome {
            PipOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }
}
