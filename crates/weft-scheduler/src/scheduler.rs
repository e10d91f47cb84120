use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use weft_cache::{CacheBackend, ContentStore, InMemoryCache, LocalDiskCache};
use weft_config::{CacheKind, ConfigValidationError, WeftConfig};
use weft_core::{Pip, PipGraph, PipId};
use weft_fingerprint::{AccessReport, FileSystemView, RealFileSystem};
use weft_resource::{
    CancelReason, MachinePerfInfo, PerformanceSampler, PipControl, ResourceManager,
    ResourcePressure, SysinfoSampler,
};

use crate::config::SchedulerConfig;
use crate::engine::{Engine, Replay};
use crate::error::{PipFailure, SetupError};
use crate::executor::{ExecutionOutcome, ExecutionRequest, PipExecutor, ProcessPipExecutor};
use crate::hub::{AccessReportHub, HubError};
use crate::report::{BuildCounters, BuildReport, PipOutcome, SkipReason};
use crate::state::{PipState, PipStateTable};

/// Pause before re-checking dispatch admission after the resource manager refused it.
const DISPATCH_BACKOFF: Duration = Duration::from_millis(20);
/// Granularity of the per-pip deadline watchdog.
const DEADLINE_TICK: Duration = Duration::from_millis(20);
/// Added to the kill grace before a cancelled executor is abandoned.
const CANCEL_BACKSTOP: Duration = Duration::from_secs(5);

/// External collaborators of a build.
#[derive(Clone)]
pub struct SchedulerServices {
    pub cache: Arc<dyn CacheBackend>,
    pub store: Arc<dyn ContentStore>,
    pub executor: Arc<dyn PipExecutor>,
    pub fs: Arc<dyn FileSystemView>,
    /// Polled every `perf_sample_interval`; without one, samples only arrive through
    /// [`SchedulerHandle::report_perf_sample`].
    pub sampler: Option<Arc<dyn PerformanceSampler>>,
}

impl SchedulerServices {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn ContentStore>,
        executor: Arc<dyn PipExecutor>,
    ) -> Self {
        Self {
            cache,
            store,
            executor,
            fs: Arc::new(RealFileSystem),
            sampler: None,
        }
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystemView>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn PerformanceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Services for a real build session: the configured cache, a process executor, a
    /// machine sampler, and the global tracing subscriber.
    pub fn from_config(config: &WeftConfig) -> Result<Self, SetupError> {
        let diagnostics = config.validate();
        if !diagnostics.is_ok() {
            return Err(SetupError::InvalidConfig(diagnostics.errors));
        }
        weft_config::init_tracing(&config.logging);

        let executor = Arc::new(ProcessPipExecutor::from_config(&config.sandbox));
        let services = match config.cache.kind {
            CacheKind::Memory => {
                let cache = Arc::new(InMemoryCache::new());
                Self::new(cache.clone(), cache, executor)
            }
            CacheKind::Disk => {
                let Some(root) = config.cache.root.as_deref() else {
                    return Err(SetupError::InvalidConfig(vec![
                        ConfigValidationError::DiskCacheMissingRoot,
                    ]));
                };
                let cache = Arc::new(LocalDiskCache::open(root)?);
                tracing::info!(target = "weft.scheduler", root = %root.display(), "using disk cache");
                Self::new(cache.clone(), cache, executor)
            }
        };

        let disk_path = match &config.cache.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_default(),
        };
        Ok(services.with_sampler(Arc::new(SysinfoSampler::new(disk_path))))
    }
}

#[derive(Debug)]
enum ControlMessage {
    PerfSample(MachinePerfInfo),
    Cancel,
}

/// Why the build stopped dispatching new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    StopOnFailure,
    Fatal,
    Cancelled,
    DiskExhausted,
}

/// Talks to a running build: the sandbox side posts access reports, the host side feeds
/// machine samples or cancels.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    hub: AccessReportHub,
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl SchedulerHandle {
    pub async fn post_access_report(&self, pip: PipId, report: AccessReport) -> Result<(), HubError> {
        self.hub.post(pip, report).await
    }

    /// End of the access stream for `pip`'s current process tree.
    pub async fn on_process_terminated(&self, pip: PipId) {
        self.hub.terminate(pip).await;
    }

    pub fn report_perf_sample(&self, sample: MachinePerfInfo) {
        if self.control.send(ControlMessage::PerfSample(sample)).is_err() {
            tracing::debug!(target = "weft.scheduler", "perf sample after build finished");
        }
    }

    /// Cancel running pips and skip everything not yet started.
    pub fn cancel(&self) {
        if self.control.send(ControlMessage::Cancel).is_err() {
            tracing::debug!(target = "weft.scheduler", "cancel after build finished");
        }
    }
}

struct Shared {
    graph: Arc<PipGraph>,
    config: SchedulerConfig,
    engine: Engine,
    executor: Arc<dyn PipExecutor>,
    states: PipStateTable,
    resources: ResourceManager,
    hub: AccessReportHub,
    slots: Semaphore,
    halt: Mutex<Option<Halt>>,
    counters: Mutex<BuildCounters>,
}

impl Shared {
    fn transition(&self, pip: PipId, to: PipState) -> Result<(), PipFailure> {
        self.states
            .transition(pip, to)
            .map(|_| ())
            .map_err(|err| PipFailure::internal(pip, err.to_string()))
    }

    fn count(&self, update: impl FnOnce(&mut BuildCounters)) {
        update(&mut self.counters.lock());
    }

    fn halted(&self) -> Option<Halt> {
        *self.halt.lock()
    }

    /// Record a halt. Disk exhaustion overrides any earlier reason; otherwise the first wins.
    fn halt(&self, reason: Halt) {
        {
            let mut halt = self.halt.lock();
            let replace = match *halt {
                None => true,
                Some(current) => current != reason && reason == Halt::DiskExhausted,
            };
            if !replace {
                return;
            }
            *halt = Some(reason);
        }
        tracing::info!(target = "weft.scheduler", reason = ?reason, "build halted");
    }

    fn note_failure(&self, failure: &PipFailure) {
        if failure.is_build_fatal() {
            self.halt(Halt::Fatal);
        }
        if self.config.stop_on_first_failure {
            self.halt(Halt::StopOnFailure);
        }
    }

    /// Settle a pip that never started executing because the build halted.
    fn halted_outcome(&self, pip: PipId, halt: Halt) -> PipOutcome {
        let (state, outcome) = match halt {
            Halt::StopOnFailure | Halt::Fatal => (
                PipState::Skipped,
                PipOutcome::Skipped {
                    reason: SkipReason::BuildHalted,
                },
            ),
            Halt::Cancelled => (
                PipState::Skipped,
                PipOutcome::Skipped {
                    reason: SkipReason::Cancelled,
                },
            ),
            Halt::DiskExhausted => (
                PipState::DoneFailed,
                PipOutcome::Failed(PipFailure::ResourceExhaustion {
                    pip,
                    reason: CancelReason::DiskExhausted,
                    retries: 0,
                }),
            ),
        };
        if let Err(failure) = self.transition(pip, state) {
            return PipOutcome::Failed(failure);
        }
        outcome
    }

    /// Wait for an execution slot the resource manager is willing to fill.
    async fn acquire_slot(&self, pip: &Pip) -> Result<SemaphorePermit<'_>, Halt> {
        loop {
            if let Some(halt) = self.halted() {
                return Err(halt);
            }
            let Ok(permit) = self.slots.acquire().await else {
                return Err(Halt::Cancelled);
            };
            if let Some(halt) = self.halted() {
                return Err(halt);
            }
            if self.resources.can_dispatch(pip.options.expected_ram_mb) {
                return Ok(permit);
            }
            drop(permit);
            tokio::time::sleep(DISPATCH_BACKOFF).await;
        }
    }

    /// Run `phase` on the blocking pool.
    async fn blocking<T, F>(self: &Arc<Self>, pip: &Pip, phase: F) -> Result<T, PipFailure>
    where
        T: Send + 'static,
        F: FnOnce(&Engine, &Pip) -> Result<T, PipFailure> + Send + 'static,
    {
        let shared = Arc::clone(self);
        let owned = pip.clone();
        let id = pip.id;
        tokio::task::spawn_blocking(move || phase(&shared.engine, &owned))
            .await
            .map_err(|err| PipFailure::internal(id, format!("blocking task failed: {err}")))?
    }
}

/// Result of one execution attempt.
enum Attempt {
    Exited {
        exit_code: Option<i32>,
        reports: Vec<AccessReport>,
    },
    Cancelled(CancelReason),
}

/// What to do after an attempt.
enum Verdict {
    Succeeded {
        exit_code: i32,
        reports: Vec<AccessReport>,
    },
    RetryExitCode,
    RetryResources,
    Fail(PipFailure),
    Skip(SkipReason),
}

/// Drives a [`PipGraph`] to completion.
pub struct Scheduler {
    shared: Arc<Shared>,
    sampler: Option<Arc<dyn PerformanceSampler>>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl Scheduler {
    pub fn new(graph: Arc<PipGraph>, config: SchedulerConfig, services: SchedulerServices) -> Self {
        let engine = Engine::new(
            Arc::clone(&graph),
            services.fs,
            services.cache,
            services.store,
            config.observation.clone(),
            config.fingerprint_salt.clone(),
        );
        let resources = ResourceManager::new(
            config.thresholds,
            config.manage_memory_mode,
            config.max_resource_retries,
        );
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            states: PipStateTable::new(graph.pips().map(|pip| pip.id)),
            hub: AccessReportHub::new(config.access_report_capacity),
            slots: Semaphore::new(config.max_parallelism.max(1)),
            graph,
            engine,
            executor: services.executor,
            resources,
            halt: Mutex::new(None),
            counters: Mutex::new(BuildCounters::default()),
            config,
        };
        Self {
            shared: Arc::new(shared),
            sampler: services.sampler,
            control_tx,
            control_rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            hub: self.shared.hub.clone(),
            control: self.control_tx.clone(),
        }
    }

    /// The resource manager driving this build, e.g. to subscribe to pressure events.
    pub fn resources(&self) -> &ResourceManager {
        &self.shared.resources
    }

    /// Current state of every pip.
    pub fn states(&self) -> HashMap<PipId, PipState> {
        self.shared.states.snapshot()
    }

    /// Run the build until every pip is in a terminal state.
    pub async fn run(self) -> BuildReport {
        let Scheduler {
            shared,
            sampler,
            control_tx,
            mut control_rx,
        } = self;
        drop(control_tx);

        let graph = Arc::clone(&shared.graph);
        tracing::info!(
            target = "weft.scheduler",
            pips = graph.len(),
            max_parallelism = shared.config.max_parallelism,
            cache_only = shared.config.cache_only,
            "build started"
        );

        let mut coordinator = Coordinator {
            shared: Arc::clone(&shared),
            remaining: graph
                .pips()
                .map(|pip| (pip.id, graph.dependencies(pip.id).len()))
                .collect(),
            ready: BinaryHeap::new(),
            in_flight: HashSet::new(),
            outcomes: BTreeMap::new(),
            fatal: None,
        };
        for pip in graph.topological_order() {
            if coordinator.remaining.get(&pip) == Some(&0) {
                coordinator.ready.push(Reverse((graph.priority(pip), pip)));
            }
        }

        let mut workers: JoinSet<(PipId, PipOutcome)> = JoinSet::new();
        let mut sampling = sampler.as_ref().map(|_| {
            let mut interval = tokio::time::interval(shared.config.perf_sample_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut control_open = true;

        loop {
            coordinator.dispatch(&mut workers);
            if workers.is_empty() {
                break;
            }
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((pip, outcome))) => coordinator.settle(pip, outcome),
                    Some(Err(err)) => {
                        tracing::error!(target = "weft.scheduler", error = %err, "pip worker task failed");
                    }
                    None => {}
                },
                message = control_rx.recv(), if control_open => match message {
                    Some(ControlMessage::PerfSample(sample)) => coordinator.observe(sample),
                    Some(ControlMessage::Cancel) => coordinator.cancel(),
                    None => control_open = false,
                },
                () = next_tick(&mut sampling) => {
                    if let Some(sampler) = sampler.as_ref() {
                        let sampler = Arc::clone(sampler);
                        match tokio::task::spawn_blocking(move || sampler.sample()).await {
                            Ok(sample) => coordinator.observe(sample),
                            Err(err) => {
                                tracing::warn!(target = "weft.scheduler", error = %err, "performance sampler failed");
                            }
                        }
                    }
                }
            }
        }

        coordinator.finish()
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Dependency bookkeeping; owned by the task running [`Scheduler::run`].
struct Coordinator {
    shared: Arc<Shared>,
    /// Unfinished dependencies per pip.
    remaining: HashMap<PipId, usize>,
    ready: BinaryHeap<Reverse<(usize, PipId)>>,
    in_flight: HashSet<PipId>,
    outcomes: BTreeMap<PipId, PipOutcome>,
    fatal: Option<PipFailure>,
}

impl Coordinator {
    fn dispatch(&mut self, workers: &mut JoinSet<(PipId, PipOutcome)>) {
        while let Some(Reverse((_, pip))) = self.ready.pop() {
            // Left pending; `finish` settles them according to the halt reason.
            if self.shared.halted().is_some() {
                continue;
            }
            if let Err(failure) = self.shared.transition(pip, PipState::Ready) {
                self.record(pip, PipOutcome::Failed(failure));
                continue;
            }
            self.in_flight.insert(pip);
            let shared = Arc::clone(&self.shared);
            workers.spawn(async move {
                let outcome = run_pip(&shared, pip).await;
                (pip, outcome)
            });
        }
    }

    fn settle(&mut self, pip: PipId, outcome: PipOutcome) {
        self.in_flight.remove(&pip);
        let release = match &outcome {
            PipOutcome::Executed { .. } | PipOutcome::CacheHit => true,
            PipOutcome::Failed(failure) => {
                self.shared.note_failure(failure);
                if failure.is_build_fatal() {
                    self.fatal.get_or_insert_with(|| failure.clone());
                    let cancelled = self.shared.resources.cancel_all(CancelReason::BuildCancelled);
                    tracing::error!(
                        target = "weft.scheduler",
                        %failure,
                        cancelled = cancelled.len(),
                        "build-fatal failure"
                    );
                }
                self.shared.config.best_effort
            }
            PipOutcome::Skipped { .. } => false,
        };
        self.record(pip, outcome);

        for dependent in self.shared.graph.dependents(pip) {
            if self.outcomes.contains_key(&dependent) {
                continue;
            }
            if release {
                let Some(remaining) = self.remaining.get_mut(&dependent) else {
                    continue;
                };
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    let priority = self.shared.graph.priority(dependent);
                    self.ready.push(Reverse((priority, dependent)));
                }
            } else {
                self.skip_downstream(dependent);
            }
        }
    }

    /// Skip `root` and everything that depends on it.
    fn skip_downstream(&mut self, root: PipId) {
        let mut stack = vec![root];
        while let Some(pip) = stack.pop() {
            if self.outcomes.contains_key(&pip) || self.in_flight.contains(&pip) {
                continue;
            }
            let outcome = match self.shared.transition(pip, PipState::Skipped) {
                Ok(()) => PipOutcome::Skipped {
                    reason: SkipReason::DependencyFailed,
                },
                Err(failure) => PipOutcome::Failed(failure),
            };
            tracing::debug!(target = "weft.scheduler", %pip, "skipped: upstream did not succeed");
            self.record(pip, outcome);
            stack.extend(self.shared.graph.dependents(pip));
        }
    }

    fn record(&mut self, pip: PipId, outcome: PipOutcome) {
        self.shared.count(|counters| match &outcome {
            PipOutcome::Executed { stored, .. } => {
                counters.executed += 1;
                if *stored {
                    counters.stored += 1;
                } else {
                    counters.uncacheable += 1;
                }
            }
            PipOutcome::CacheHit => counters.cache_hits += 1,
            PipOutcome::Failed(_) => counters.failed += 1,
            PipOutcome::Skipped { .. } => counters.skipped += 1,
        });
        if let PipOutcome::Failed(failure) = &outcome {
            tracing::warn!(target = "weft.scheduler", %pip, %failure, "pip failed");
        }
        self.outcomes.insert(pip, outcome);
    }

    fn observe(&mut self, sample: MachinePerfInfo) {
        let actions = self.shared.resources.observe(sample);
        if !actions.is_empty() {
            tracing::info!(
                target = "weft.scheduler",
                actions = actions.len(),
                available_ram_mb = sample.available_ram_mb,
                "resource manager acted on running pips"
            );
        }
        if self.shared.resources.pressure() == ResourcePressure::DiskExhausted {
            self.shared.halt(Halt::DiskExhausted);
        }
    }

    fn cancel(&mut self) {
        self.shared.halt(Halt::Cancelled);
        self.shared.resources.cancel_all(CancelReason::BuildCancelled);
    }

    fn finish(mut self) -> BuildReport {
        let halt = self.shared.halted();
        for pip in self.shared.graph.topological_order() {
            if self.outcomes.contains_key(&pip) {
                continue;
            }
            let outcome = if self.in_flight.remove(&pip) {
                PipOutcome::Failed(PipFailure::internal(pip, "pip worker ended without an outcome"))
            } else {
                match halt {
                    Some(halt) => self.shared.halted_outcome(pip, halt),
                    None => match self.shared.transition(pip, PipState::Skipped) {
                        Ok(()) => PipOutcome::Skipped {
                            reason: SkipReason::DependencyFailed,
                        },
                        Err(failure) => PipOutcome::Failed(failure),
                    },
                }
            };
            self.record(pip, outcome);
        }

        let counters = *self.shared.counters.lock();
        let report = BuildReport {
            outcomes: self.outcomes,
            counters,
            fatal: self.fatal,
        };
        tracing::info!(
            target = "weft.scheduler",
            success = report.success(),
            cache_hits = counters.cache_hits,
            executed = counters.executed,
            failed = counters.failed,
            skipped = counters.skipped,
            "build finished"
        );
        report
    }
}

async fn run_pip(shared: &Arc<Shared>, id: PipId) -> PipOutcome {
    let Some(pip) = shared.graph.pip(id) else {
        return PipOutcome::Failed(PipFailure::internal(id, "pip is not part of the graph"));
    };
    match drive(shared, pip).await {
        Ok(outcome) => outcome,
        Err(failure) => {
            settle_failed(shared, id);
            PipOutcome::Failed(failure)
        }
    }
}

fn settle_failed(shared: &Shared, pip: PipId) {
    let state = shared.states.get(pip);
    if state == Some(PipState::Executing) {
        if let Err(err) = shared.states.transition(pip, PipState::Failed) {
            tracing::error!(target = "weft.scheduler", error = %err, "cannot record failure");
        }
    }
    if shared.states.get(pip).is_some_and(PipState::is_terminal) {
        return;
    }
    if let Err(err) = shared.states.transition(pip, PipState::DoneFailed) {
        tracing::error!(target = "weft.scheduler", error = %err, "cannot record failure");
    }
}

/// One pip from `Ready` to a terminal state.
async fn drive(shared: &Arc<Shared>, pip: &Pip) -> Result<PipOutcome, PipFailure> {
    let id = pip.id;
    let config = &shared.config;
    let weak = shared
        .blocking(pip, |engine, pip| engine.weak_fingerprint(pip))
        .await?;
    tracing::debug!(target = "weft.scheduler", pip = %id, %weak, "weak fingerprint");

    if pip.options.disable_cache_lookup {
        if config.cache_only {
            shared.transition(id, PipState::Skipped)?;
            return Ok(PipOutcome::Skipped {
                reason: SkipReason::CacheMiss,
            });
        }
    } else {
        shared.transition(id, PipState::CacheLookup)?;
        let hit = shared
            .blocking(pip, move |engine, pip| Ok(engine.lookup(pip, weak)))
            .await?;
        if let Some(hit) = hit {
            shared.transition(id, PipState::CacheHit)?;
            shared.transition(id, PipState::Materializing)?;
            let entry = hit.entry;
            match shared
                .blocking(pip, move |engine, pip| engine.replay(pip, &entry))
                .await?
            {
                Replay::Restored { written, removed } => {
                    shared.count(|counters| counters.replayed_files += written);
                    shared.transition(id, PipState::Done)?;
                    tracing::debug!(target = "weft.scheduler", pip = %id, strong = %hit.strong, written, removed, "cache hit");
                    return Ok(PipOutcome::CacheHit);
                }
                Replay::Unusable(reason) => {
                    tracing::warn!(target = "weft.scheduler", pip = %id, %reason, "cache entry unusable; executing instead");
                }
            }
        }
        shared.transition(id, PipState::CacheMiss)?;
        shared.count(|counters| counters.cache_misses += 1);
        if config.cache_only {
            shared.transition(id, PipState::Skipped)?;
            return Ok(PipOutcome::Skipped {
                reason: SkipReason::CacheMiss,
            });
        }
    }

    let mut attempt = 0;
    let mut exit_code_retries = 0;
    let (exit_code, reports) = loop {
        let permit = match shared.acquire_slot(pip).await {
            Ok(permit) => permit,
            Err(halt) => return Ok(shared.halted_outcome(id, halt)),
        };
        attempt += 1;
        shared.transition(id, PipState::Executing)?;
        let verdict = match execute(shared, pip, attempt).await {
            Ok(attempted) => judge(shared, pip, attempted, exit_code_retries, attempt),
            Err(failure) => Verdict::Fail(failure),
        };
        if let Verdict::Fail(failure) = &verdict {
            // Before the slot is released, so nothing else starts after a stopping failure.
            shared.note_failure(failure);
        }
        drop(permit);

        match verdict {
            Verdict::Succeeded { exit_code, reports } => {
                shared.transition(id, PipState::Succeeded)?;
                break (exit_code, reports);
            }
            Verdict::RetryExitCode => {
                exit_code_retries += 1;
                shared.count(|counters| counters.exit_code_retries += 1);
                retry(shared, id)?;
            }
            Verdict::RetryResources => {
                shared.count(|counters| counters.resource_retries += 1);
                retry(shared, id)?;
            }
            Verdict::Fail(failure) => return Err(failure),
            Verdict::Skip(reason) => {
                shared.transition(id, PipState::Failed)?;
                shared.transition(id, PipState::Skipped)?;
                return Ok(PipOutcome::Skipped { reason });
            }
        }
    };

    let analysis = shared
        .blocking(pip, move |engine, pip| engine.analyze(pip, weak, reports))
        .await?;
    let stored = match analysis.publication {
        Some(publication) => {
            shared.transition(id, PipState::StoringToCache)?;
            let outputs = analysis.outputs;
            shared
                .blocking(pip, move |engine, pip| {
                    engine.publish(pip, weak, &publication, outputs, exit_code)
                })
                .await?
        }
        None => {
            tracing::debug!(target = "weft.scheduler", pip = %id, "execution is not cacheable");
            false
        }
    };
    shared.transition(id, PipState::Done)?;
    Ok(PipOutcome::Executed {
        stored,
        exit_code,
        attempts: attempt,
        resource_retries: shared.resources.resource_retries(id),
    })
}

fn retry(shared: &Shared, pip: PipId) -> Result<(), PipFailure> {
    shared.transition(pip, PipState::Failed)?;
    shared.transition(pip, PipState::Retry)?;
    shared.transition(pip, PipState::Ready)
}

fn judge(
    shared: &Shared,
    pip: &Pip,
    attempted: Attempt,
    exit_code_retries: u32,
    attempts: u32,
) -> Verdict {
    let id = pip.id;
    match attempted {
        Attempt::Exited {
            exit_code: Some(code),
            reports,
        } if pip.options.is_success(code) => Verdict::Succeeded {
            exit_code: code,
            reports,
        },
        Attempt::Exited {
            exit_code: Some(code),
            ..
        } if pip.options.is_retryable(code) && exit_code_retries < pip.options.max_retries => {
            tracing::info!(target = "weft.scheduler", pip = %id, code, attempts, "retrying after exit code");
            Verdict::RetryExitCode
        }
        Attempt::Exited { exit_code, .. } => Verdict::Fail(PipFailure::ProcessExit {
            pip: id,
            exit_code,
            timed_out: false,
            attempts,
        }),
        Attempt::Cancelled(CancelReason::LowMemory) if shared.resources.record_resource_retry(id) => {
            tracing::info!(target = "weft.scheduler", pip = %id, attempts, "retrying after low-memory cancellation");
            Verdict::RetryResources
        }
        Attempt::Cancelled(reason @ (CancelReason::LowMemory | CancelReason::DiskExhausted)) => {
            Verdict::Fail(PipFailure::ResourceExhaustion {
                pip: id,
                reason,
                retries: shared.resources.resource_retries(id).saturating_sub(1),
            })
        }
        Attempt::Cancelled(CancelReason::Timeout) => Verdict::Fail(PipFailure::ProcessExit {
            pip: id,
            exit_code: None,
            timed_out: true,
            attempts,
        }),
        Attempt::Cancelled(CancelReason::BuildCancelled) => Verdict::Skip(SkipReason::Cancelled),
    }
}

/// Run one attempt under resource control, collecting its access reports.
async fn execute(shared: &Arc<Shared>, pip: &Pip, attempt: u32) -> Result<Attempt, PipFailure> {
    let id = pip.id;
    let control = PipControl::new();
    let _registration = shared
        .resources
        .register(id, pip.options.expected_ram_mb, control.clone());
    // A halt may have cancelled everything between admission and registration.
    if let Some(halt) = shared.halted() {
        control.cancel(match halt {
            Halt::DiskExhausted => CancelReason::DiskExhausted,
            _ => CancelReason::BuildCancelled,
        });
    }

    let receiver = shared.hub.open(id);
    let drain = tokio::spawn(receiver.collect());
    let request = ExecutionRequest {
        pip: pip.clone(),
        path_table: Arc::clone(shared.graph.path_table()),
        attempt,
        control: control.clone(),
        reporter: shared.hub.reporter(id),
    };
    let timeout = pip.options.timeout.or(shared.config.default_timeout);
    tracing::debug!(target = "weft.scheduler", pip = %id, attempt, description = %pip.description, "executing");

    let outcome = supervise(
        shared.executor.execute(request),
        &control,
        timeout,
        shared.config.kill_grace,
    )
    .await;

    shared.hub.terminate(id).await;
    let reports = drain
        .await
        .map_err(|err| PipFailure::internal(id, format!("access report collection failed: {err}")))?;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(Supervision::Io(err)) => {
            return Err(PipFailure::Io {
                pip: id,
                path: shared.graph.path_table().expand(pip.executable).to_string(),
                message: err.to_string(),
            })
        }
        Err(Supervision::Abandoned) => {
            return Err(PipFailure::internal(
                id,
                "executor did not stop after cancellation",
            ))
        }
    };

    if outcome.cancelled {
        return match control.cancel_reason() {
            Some(reason) => Ok(Attempt::Cancelled(reason)),
            None => Err(PipFailure::internal(
                id,
                "executor reported a cancellation nobody requested",
            )),
        };
    }
    if !outcome.stderr.is_empty() {
        tracing::debug!(target = "weft.scheduler", pip = %id, stderr = %outcome.stderr, "pip stderr");
    }
    Ok(Attempt::Exited {
        exit_code: outcome.exit_code,
        reports,
    })
}

enum Supervision {
    Io(io::Error),
    Abandoned,
}

/// Await the executor, cancelling it once `timeout` of unsuspended time has passed.
///
/// After cancellation the executor gets the kill grace plus a backstop to return.
async fn supervise(
    run: impl Future<Output = io::Result<ExecutionOutcome>>,
    control: &PipControl,
    timeout: Option<Duration>,
    kill_grace: Duration,
) -> Result<ExecutionOutcome, Supervision> {
    tokio::pin!(run);
    tokio::select! {
        outcome = &mut run => return outcome.map_err(Supervision::Io),
        () = active_deadline(control, timeout) => control.cancel(CancelReason::Timeout),
        () = control.cancelled() => {}
    }
    match tokio::time::timeout(kill_grace + CANCEL_BACKSTOP, run).await {
        Ok(outcome) => outcome.map_err(Supervision::Io),
        Err(_) => Err(Supervision::Abandoned),
    }
}

/// Completes once the pip has been running, not suspended, for `timeout`.
async fn active_deadline(control: &PipControl, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    let mut active = Duration::ZERO;
    let mut last = Instant::now();
    while active < timeout {
        tokio::time::sleep(DEADLINE_TICK.min(timeout - active)).await;
        let now = Instant::now();
        if !control.is_suspended() {
            active += now - last;
        }
        last = now;
    }
}
