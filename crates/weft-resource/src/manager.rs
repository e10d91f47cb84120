use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use weft_core::PipId;

use crate::control::{CancelReason, PipControl};
use crate::perf::{self, MachinePerfInfo};
use crate::pressure::{ResourcePressure, ResourceThresholds};

type ResourceEventListener = Arc<dyn Fn(ResourceEvent) + Send + Sync>;

/// What to do with running pips when memory runs low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageMemoryMode {
    /// Cancel the most recently started pips; they are retried later.
    #[default]
    CancelMostRecent,
    /// Suspend the most recently started pips and resume them once memory recovers.
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceActionKind {
    Cancel(CancelReason),
    Suspend,
    Resume,
}

/// One action applied to a running pip by [`ResourceManager::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAction {
    pub pip: PipId,
    pub kind: ResourceActionKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceReport {
    pub pressure: Option<ResourcePressure>,
    pub running: usize,
    pub suspended: usize,
    /// Sum of the expected RAM of running, unsuspended pips.
    pub expected_running_ram_mb: u64,
    pub last_sample: Option<MachinePerfInfo>,
    pub scheduler_rss_bytes: Option<u64>,
}

/// Emitted to listeners when the pressure level changes (after actions are applied).
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub previous: ResourcePressure,
    pub pressure: ResourcePressure,
    pub report: ResourceReport,
}

struct RunningPip {
    pip: PipId,
    expected_ram_mb: u64,
    control: PipControl,
    suspended: bool,
}

impl RunningPip {
    fn is_active(&self) -> bool {
        !self.suspended && !self.control.is_cancelled()
    }
}

struct State {
    pressure: ResourcePressure,
    last_sample: Option<MachinePerfInfo>,
    /// RAM promised to pips dispatched since `last_sample` was taken.
    dispatched_since_sample_mb: u64,
    resource_retries: HashMap<PipId, u32>,
}

struct Inner {
    thresholds: ResourceThresholds,
    mode: ManageMemoryMode,
    max_resource_retries: u32,
    next_seq: AtomicU64,
    // Keyed by start sequence, so iteration order is start order.
    running: Mutex<BTreeMap<u64, RunningPip>>,
    state: Mutex<State>,
    listeners: Mutex<Vec<ResourceEventListener>>,
}

/// Tracks running pips against machine samples and decides who gets cancelled, suspended or
/// resumed.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(
        thresholds: ResourceThresholds,
        mode: ManageMemoryMode,
        max_resource_retries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                thresholds,
                mode,
                max_resource_retries,
                next_seq: AtomicU64::new(1),
                running: Mutex::new(BTreeMap::new()),
                state: Mutex::new(State {
                    pressure: ResourcePressure::Normal,
                    last_sample: None,
                    dispatched_since_sample_mb: 0,
                    resource_retries: HashMap::new(),
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        self.inner.thresholds
    }

    pub fn mode(&self) -> ManageMemoryMode {
        self.inner.mode
    }

    pub fn subscribe(&self, listener: ResourceEventListener) {
        self.inner.listeners.lock().push(listener);
    }

    pub fn pressure(&self) -> ResourcePressure {
        self.inner.state.lock().pressure
    }

    /// Track a pip that is about to start. Dropping the registration stops tracking it.
    pub fn register(&self, pip: PipId, expected_ram_mb: u64, control: PipControl) -> ResourceRegistration {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.running.lock().insert(
            seq,
            RunningPip {
                pip,
                expected_ram_mb,
                control,
                suspended: false,
            },
        );
        {
            let mut state = self.inner.state.lock();
            state.dispatched_since_sample_mb =
                state.dispatched_since_sample_mb.saturating_add(expected_ram_mb);
        }
        ResourceRegistration {
            seq,
            pip,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Whether a pip expecting `expected_ram_mb` may start now.
    ///
    /// Always true when nothing is running, so the build keeps making progress.
    pub fn can_dispatch(&self, expected_ram_mb: u64) -> bool {
        if self.inner.running.lock().is_empty() {
            return true;
        }
        let state = self.inner.state.lock();
        if state.pressure != ResourcePressure::Normal {
            return false;
        }
        let Some(sample) = state.last_sample else {
            return true;
        };
        let projected = sample
            .available_ram_mb
            .saturating_sub(state.dispatched_since_sample_mb)
            .saturating_sub(expected_ram_mb);
        self.inner.thresholds.ram_ok(projected, sample.total_ram_mb())
    }

    /// Feed a new machine sample; returns the actions applied to running pips.
    pub fn observe(&self, sample: MachinePerfInfo) -> Vec<ResourceAction> {
        let (previous, pressure) = {
            let mut state = self.inner.state.lock();
            let previous = state.pressure;
            let pressure = self.inner.thresholds.classify(&sample, previous);
            state.pressure = pressure;
            state.last_sample = Some(sample);
            state.dispatched_since_sample_mb = 0;
            (previous, pressure)
        };

        let actions = {
            let mut running = self.inner.running.lock();
            let actions = match pressure {
                ResourcePressure::DiskExhausted => running
                    .values()
                    .filter(|entry| !entry.control.is_cancelled())
                    .map(|entry| ResourceAction {
                        pip: entry.pip,
                        kind: ResourceActionKind::Cancel(CancelReason::DiskExhausted),
                    })
                    .collect(),
                ResourcePressure::LowMemory => {
                    // Only a sample that crosses an entry limit sheds work; the hysteresis band
                    // just holds back new dispatch.
                    let entering = self
                        .inner
                        .thresholds
                        .classify(&sample, ResourcePressure::Normal)
                        == ResourcePressure::LowMemory;
                    if entering {
                        self.shed(&running, &sample)
                    } else {
                        Vec::new()
                    }
                }
                ResourcePressure::Normal => self.resume(&running, &sample),
            };
            apply(&mut running, &actions);
            actions
        };

        for action in &actions {
            tracing::info!(
                target = "weft.resource",
                pip = %action.pip,
                action = ?action.kind,
                ?pressure,
                available_ram_mb = sample.available_ram_mb,
                "resource action"
            );
        }

        if previous != pressure {
            tracing::debug!(
                target = "weft.resource",
                ?previous,
                ?pressure,
                "resource pressure changed"
            );
            let event = ResourceEvent {
                previous,
                pressure,
                report: self.report(),
            };
            let listeners = self.inner.listeners.lock().clone();
            for listener in listeners {
                listener(event.clone());
            }
        }

        actions
    }

    fn shed(&self, running: &BTreeMap<u64, RunningPip>, sample: &MachinePerfInfo) -> Vec<ResourceAction> {
        let total = sample.total_ram_mb();
        let active: Vec<&RunningPip> = running.values().filter(|entry| entry.is_active()).collect();
        let kind = match self.inner.mode {
            ManageMemoryMode::CancelMostRecent => ResourceActionKind::Cancel(CancelReason::LowMemory),
            ManageMemoryMode::Suspend => ResourceActionKind::Suspend,
        };

        let mut actions = Vec::new();
        let mut freed = 0u64;
        // Newest first; the oldest active pip always keeps running.
        for entry in active.iter().skip(1).rev() {
            if freed > 0
                && self
                    .inner
                    .thresholds
                    .ram_ok(sample.available_ram_mb.saturating_add(freed), total)
            {
                break;
            }
            freed = freed.saturating_add(entry.expected_ram_mb.max(1));
            actions.push(ResourceAction {
                pip: entry.pip,
                kind,
            });
        }
        actions
    }

    fn resume(&self, running: &BTreeMap<u64, RunningPip>, sample: &MachinePerfInfo) -> Vec<ResourceAction> {
        let total = sample.total_ram_mb();
        let any_active = running.values().any(RunningPip::is_active);
        let mut actions = Vec::new();
        let mut committed = 0u64;
        for entry in running
            .values()
            .filter(|entry| entry.suspended && !entry.control.is_cancelled())
        {
            let needed = committed.saturating_add(entry.expected_ram_mb);
            let fits = self
                .inner
                .thresholds
                .ram_ok(sample.available_ram_mb.saturating_sub(needed), total);
            // With nothing else making progress the oldest suspended pip resumes regardless.
            if !fits && (any_active || !actions.is_empty()) {
                break;
            }
            committed = needed;
            actions.push(ResourceAction {
                pip: entry.pip,
                kind: ResourceActionKind::Resume,
            });
        }
        actions
    }

    /// Cancel every registered pip that is still running.
    pub fn cancel_all(&self, reason: CancelReason) -> Vec<ResourceAction> {
        let mut running = self.inner.running.lock();
        let actions: Vec<ResourceAction> = running
            .values()
            .filter(|entry| !entry.control.is_cancelled())
            .map(|entry| ResourceAction {
                pip: entry.pip,
                kind: ResourceActionKind::Cancel(reason),
            })
            .collect();
        apply(&mut running, &actions);
        actions
    }

    /// Count a low-memory retry for `pip`. Returns false once the budget is exhausted.
    pub fn record_resource_retry(&self, pip: PipId) -> bool {
        let mut state = self.inner.state.lock();
        let count = state.resource_retries.entry(pip).or_insert(0);
        *count += 1;
        *count <= self.inner.max_resource_retries
    }

    pub fn resource_retries(&self, pip: PipId) -> u32 {
        self.inner
            .state
            .lock()
            .resource_retries
            .get(&pip)
            .copied()
            .unwrap_or(0)
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.lock().len()
    }

    pub fn report(&self) -> ResourceReport {
        let (running, suspended, expected_running_ram_mb) = {
            let running = self.inner.running.lock();
            let suspended = running.values().filter(|entry| entry.suspended).count();
            let expected = running
                .values()
                .filter(|entry| entry.is_active())
                .map(|entry| entry.expected_ram_mb)
                .sum();
            (running.len(), suspended, expected)
        };
        let state = self.inner.state.lock();
        ResourceReport {
            pressure: Some(state.pressure),
            running,
            suspended,
            expected_running_ram_mb,
            last_sample: state.last_sample,
            scheduler_rss_bytes: perf::scheduler_rss_bytes(),
        }
    }
}

fn apply(running: &mut BTreeMap<u64, RunningPip>, actions: &[ResourceAction]) {
    for action in actions {
        let Some(entry) = running.values_mut().find(|entry| entry.pip == action.pip) else {
            continue;
        };
        match action.kind {
            ResourceActionKind::Cancel(reason) => {
                // A suspended child must run again to observe its cancellation.
                entry.suspended = false;
                entry.control.resume();
                entry.control.cancel(reason);
            }
            ResourceActionKind::Suspend => {
                entry.suspended = true;
                entry.control.suspend();
            }
            ResourceActionKind::Resume => {
                entry.suspended = false;
                entry.control.resume();
            }
        }
    }
}

/// Keeps a pip tracked by the [`ResourceManager`] until dropped.
pub struct ResourceRegistration {
    seq: u64,
    pip: PipId,
    manager: Weak<Inner>,
}

impl ResourceRegistration {
    pub fn pip(&self) -> PipId {
        self.pip
    }
}

impl Drop for ResourceRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.running.lock().remove(&self.seq);
        }
    }
}
