use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use weft_core::PipId;

/// Lifecycle of one pip within a build.
///
/// ```text
/// Pending -> Ready -> CacheLookup -> CacheHit -> Materializing -> Done
///                                 -> CacheMiss -> Executing -> Succeeded -> StoringToCache -> Done
///                                                           -> Failed -> Retry -> Ready
///                                                                     -> DoneFailed
/// ```
///
/// `Skipped` and `DoneFailed` can also be entered from any state before execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipState {
    Pending,
    Ready,
    CacheLookup,
    CacheHit,
    Materializing,
    CacheMiss,
    Executing,
    Succeeded,
    StoringToCache,
    Failed,
    Retry,
    Done,
    DoneFailed,
    Skipped,
}

impl PipState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipState::Done | PipState::DoneFailed | PipState::Skipped)
    }

    pub fn can_transition_to(self, next: PipState) -> bool {
        use PipState::*;
        match (self, next) {
            (Pending, Ready | Skipped | DoneFailed) => true,
            // `Executing` directly when cache lookup is disabled.
            (Ready, CacheLookup | Executing | Skipped | DoneFailed) => true,
            (CacheLookup, CacheHit | CacheMiss | Skipped | DoneFailed) => true,
            (CacheHit, Materializing) => true,
            // A replay that cannot be verified falls back to execution.
            (Materializing, Done | CacheMiss | DoneFailed) => true,
            (CacheMiss, Executing | Skipped | DoneFailed) => true,
            (Executing, Succeeded | Failed) => true,
            (Succeeded, StoringToCache | Done | DoneFailed) => true,
            (StoringToCache, Done | DoneFailed) => true,
            // Cancelled along with the whole build.
            (Failed, Retry | DoneFailed | Skipped) => true,
            (Retry, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{pip}: invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub pip: PipId,
    pub from: PipState,
    pub to: PipState,
}

/// Current state of every pip, shared between the dispatcher and pip workers.
#[derive(Debug, Default)]
pub struct PipStateTable {
    states: Mutex<HashMap<PipId, PipState>>,
}

impl PipStateTable {
    pub fn new(pips: impl IntoIterator<Item = PipId>) -> Self {
        Self {
            states: Mutex::new(
                pips.into_iter()
                    .map(|pip| (pip, PipState::Pending))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, pip: PipId) -> Option<PipState> {
        self.states.lock().get(&pip).copied()
    }

    pub fn transition(&self, pip: PipId, to: PipState) -> Result<PipState, InvalidTransition> {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&pip) else {
            return Err(InvalidTransition {
                pip,
                from: PipState::Pending,
                to,
            });
        };
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { pip, from, to });
        }
        *state = to;
        drop(states);
        tracing::trace!(target = "weft.scheduler", %pip, %from, %to, "pip state");
        Ok(from)
    }

    pub fn snapshot(&self) -> HashMap<PipId, PipState> {
        self.states.lock().clone()
    }
}
