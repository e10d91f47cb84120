use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use weft_cache::InMemoryCache;
use weft_core::{
    AbsolutePath, FileArtifact, Mount, MountPolicy, PathTable, PipBuilder, PipGraph,
    PipGraphBuilder, PipId,
};
use weft_fingerprint::{AccessKind, AccessReport};
use weft_scheduler::{
    BuildReport, ExecutionOutcome, ExecutionRequest, PipExecutor, Scheduler, SchedulerConfig,
    SchedulerServices,
};

/// A temp directory with `src/` (read-only), `out/` (read/write) and `sys/` (untrackable)
/// mounts.
pub struct Workspace {
    _dir: TempDir,
    root: String,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["src", "out", "sys"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let root = dir.path().to_string_lossy().into_owned();
        Self { _dir: dir, root }
    }

    pub fn abs(&self, rel: &str) -> String {
        format!("{}/{rel}", self.root)
    }

    pub fn write(&self, rel: &str, text: &str) {
        let path = self.abs(rel);
        if let Some(parent) = Path::new(&path).parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, text).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.abs(rel)).unwrap()
    }

    pub fn exists(&self, rel: &str) -> bool {
        Path::new(&self.abs(rel)).exists()
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.abs(rel)).unwrap();
    }

    /// Start a graph over a fresh path table, as a new build session would.
    pub fn graph(&self) -> GraphDraft {
        let table = Arc::new(PathTable::new());
        let mut builder = PipGraphBuilder::new(table.clone());
        for (name, policy) in [
            ("src", MountPolicy::SOURCE),
            ("out", MountPolicy::OUTPUT),
            ("sys", MountPolicy::UNTRACKED),
        ] {
            builder.add_mount(Mount {
                name: name.to_string(),
                root: table.intern(&self.abs(name)).unwrap(),
                policy,
            });
        }
        GraphDraft {
            table,
            builder,
            root: self.root.clone(),
        }
    }
}

pub struct GraphDraft {
    table: Arc<PathTable>,
    builder: PipGraphBuilder,
    root: String,
}

impl GraphDraft {
    pub fn path(&self, rel: &str) -> AbsolutePath {
        self.table.intern(&format!("{}/{rel}", self.root)).unwrap()
    }

    pub fn source(&self, rel: &str) -> FileArtifact {
        FileArtifact::source(self.path(rel))
    }

    pub fn output(&self, rel: &str) -> FileArtifact {
        FileArtifact::output(self.path(rel))
    }

    /// A pip run by the scripted tool; `description` selects its script.
    pub fn pip(&self, description: &str) -> PipBuilder {
        let cwd = self.table.intern(&self.root).unwrap();
        PipBuilder::new(self.path("src/tools/tool"), cwd)
            .description(description)
            .arg(description)
    }

    /// A pip running a real program, from the workspace root.
    pub fn command(&self, description: &str, program: &str) -> PipBuilder {
        let cwd = self.table.intern(&self.root).unwrap();
        PipBuilder::new(self.table.intern(program).unwrap(), cwd).description(description)
    }

    pub fn add(&mut self, pip: PipBuilder) -> PipId {
        let pip = pip.build(&self.table);
        self.builder.add_pip(pip).unwrap()
    }

    pub fn build(self) -> Arc<PipGraph> {
        Arc::new(self.builder.build().unwrap())
    }
}

/// One scripted action. Paths are relative to the workspace root.
#[derive(Debug, Clone)]
pub enum Step {
    /// Read a file; its content (or `<absent>`) is appended to the transcript.
    Read(&'static str),
    Probe(&'static str),
    /// List matching names (`*suffix` or an exact name) into the transcript.
    Enumerate(&'static str, &'static str),
    /// Write the transcript so far.
    Write(&'static str),
    /// Block until cancelled or `duration` of unsuspended time passes, on attempts up to
    /// `attempts`.
    Hold { duration: Duration, attempts: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub steps: Vec<Step>,
    /// Exit code per attempt; the last one repeats. Empty means 0.
    pub exit_codes: Vec<i32>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            exit_codes: Vec::new(),
        }
    }

    pub fn exits(mut self, codes: &[i32]) -> Self {
        self.exit_codes = codes.to_vec();
        self
    }

    fn exit_code(&self, attempt: u32) -> i32 {
        let idx = (attempt as usize).saturating_sub(1);
        self.exit_codes
            .get(idx)
            .or(self.exit_codes.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Executor that plays scripts keyed by pip description against the real file system and
/// reports every access it makes.
pub struct ScriptedExecutor {
    root: String,
    scripts: Mutex<HashMap<String, Script>>,
    starts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(workspace: &Workspace) -> Arc<Self> {
        Arc::new(Self {
            root: workspace.root.clone(),
            scripts: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, description: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(description.to_string(), script);
    }

    /// Descriptions of every execution started so far, in start order.
    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub fn start_count(&self, description: &str) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|start| *start == description)
            .count()
    }

    pub fn clear_starts(&self) {
        self.starts.lock().unwrap().clear();
    }

    fn abs(&self, rel: &str) -> String {
        format!("{}/{rel}", self.root)
    }
}

#[async_trait]
impl PipExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> io::Result<ExecutionOutcome> {
        let description = request.pip.description.clone();
        self.starts.lock().unwrap().push(description.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&description)
            .cloned()
            .unwrap_or_default();

        let mut transcript = vec![description];
        let mut timestamp = 0;
        for step in &script.steps {
            timestamp += 1;
            match step {
                Step::Read(rel) => {
                    let abs = self.abs(rel);
                    let content = std::fs::read_to_string(&abs).ok();
                    transcript.push(content.clone().unwrap_or_else(|| "<absent>".to_string()));
                    report(&request, &abs, AccessKind::Read, timestamp, content.is_some(), None)
                        .await;
                }
                Step::Probe(rel) => {
                    let abs = self.abs(rel);
                    let exists = Path::new(&abs).exists();
                    transcript.push(format!("probe {rel}: {exists}"));
                    report(&request, &abs, AccessKind::Probe, timestamp, exists, None).await;
                }
                Step::Enumerate(rel, pattern) => {
                    let abs = self.abs(rel);
                    let mut names: Vec<String> = std::fs::read_dir(&abs)
                        .map(|entries| {
                            entries
                                .filter_map(Result::ok)
                                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                                .filter(|name| matches_pattern(name, pattern))
                                .collect()
                        })
                        .unwrap_or_default();
                    names.sort();
                    transcript.push(format!("ls {rel}: {}", names.join(",")));
                    let exists = Path::new(&abs).is_dir();
                    report(
                        &request,
                        &abs,
                        AccessKind::Enumerate,
                        timestamp,
                        exists,
                        Some(pattern),
                    )
                    .await;
                }
                Step::Write(rel) => {
                    let abs = self.abs(rel);
                    let existed = Path::new(&abs).exists();
                    if let Some(parent) = Path::new(&abs).parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&abs, transcript.join("\n"))?;
                    report(&request, &abs, AccessKind::Write, timestamp, existed, None).await;
                }
                Step::Hold { duration, attempts } => {
                    if request.attempt > *attempts {
                        continue;
                    }
                    // Like a stopped process, a suspended hold makes no progress.
                    let mut remaining = *duration;
                    while !remaining.is_zero() {
                        if request.control.is_cancelled() {
                            return Ok(ExecutionOutcome::cancelled());
                        }
                        let tick = Duration::from_millis(5).min(remaining);
                        tokio::time::sleep(tick).await;
                        if !request.control.is_suspended() {
                            remaining -= tick;
                        }
                    }
                }
            }
        }
        Ok(ExecutionOutcome::exited(script.exit_code(request.attempt)))
    }
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()),
        None => name.eq_ignore_ascii_case(pattern),
    }
}

async fn report(
    request: &ExecutionRequest,
    abs: &str,
    kind: AccessKind,
    timestamp: u64,
    existed: bool,
    pattern: Option<&str>,
) {
    let path = request.path_table.intern(abs).unwrap();
    let mut report = AccessReport::new(path, kind, timestamp, existed);
    if let Some(pattern) = pattern {
        report = report.with_pattern(pattern);
    }
    request.reporter.report(report).await.unwrap();
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_parallelism: 4,
        ..SchedulerConfig::default()
    }
}

pub fn services(cache: &Arc<InMemoryCache>, executor: &Arc<ScriptedExecutor>) -> SchedulerServices {
    SchedulerServices::new(cache.clone(), cache.clone(), executor.clone())
}

pub async fn run(
    graph: Arc<PipGraph>,
    config: SchedulerConfig,
    cache: &Arc<InMemoryCache>,
    executor: &Arc<ScriptedExecutor>,
) -> BuildReport {
    Scheduler::new(graph, config, services(cache, executor))
        .run()
        .await
}

/// Poll `condition` until it holds or ten seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for condition"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
