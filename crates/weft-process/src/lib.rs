//! Spawning pip processes.
//!
//! A pip's process runs in its own process group so that cancellation and timeouts can take
//! down everything it spawned. Output is captured up to a fixed size per stream; tools that
//! print without bound cannot exhaust scheduler memory. On Unix the process group can also be
//! stopped and continued, which backs memory-pressure suspension.

use std::{
    fmt,
    io::{self, Read},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

pub use tokio_util::sync::CancellationToken;

/// Captured stdout/stderr from a process, truncated to a maximum size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when either stream had more bytes than were captured.
    pub truncated: bool,
}

impl BoundedOutput {
    pub fn combined(&self) -> String {
        let mut s = String::new();
        s.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

/// Options controlling process execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Kill the process tree once it has been running (not suspended) this long.
    pub timeout: Option<Duration>,
    /// Maximum bytes to capture *per stream*.
    pub max_bytes: usize,
    /// When cancelled, the process tree is terminated and `cancelled` is set on the result.
    pub cancellation: Option<CancellationToken>,
    /// While set, the process group is stopped (Unix only).
    pub suspended: Option<Arc<AtomicBool>>,
    /// Wait this long after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: 16 * 1024 * 1024,
            cancellation: None,
            suspended: None,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// A full process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Environment set on the child, in order.
    pub env: Vec<(String, String)>,
    /// Variables copied from the scheduler's own environment when present.
    pub passthrough_env: Vec<String>,
}

impl ProcessSpec {
    pub fn new(cwd: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            passthrough_env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn passthrough(mut self, name: impl Into<String>) -> Self {
        self.passthrough_env.push(name.into());
        self
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable only; not a round-trippable shell snippet.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Result of running a process with bounded output capture.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub status: ExitStatus,
    pub output: BoundedOutput,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Wall-clock time from spawn to exit.
    pub duration: Duration,
    /// Portion of `duration` spent stopped.
    pub suspended_for: Duration,
}

impl ProcessResult {
    /// Exit code, or `None` when the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run `spec`, capturing at most `opts.max_bytes` bytes of stdout and stderr each.
///
/// The child's environment is exactly `spec.env` plus the `spec.passthrough_env` variables
/// found in the current process. When the timeout elapses or the cancellation token trips, the
/// whole process group is terminated and the matching flag is set on the result.
pub fn run_process(spec: &ProcessSpec, opts: RunOptions) -> io::Result<ProcessResult> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for name in &spec.passthrough_env {
        if let Some(value) = std::env::var_os(name) {
            cmd.env(name, value);
        }
    }
    for (name, value) in &spec.env {
        cmd.env(name, value);
    }

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    tracing::debug!(target = "weft.process", pid = child.id(), command = %spec, "spawned process");

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };

    let max_bytes = opts.max_bytes;
    let stdout_handle = thread::spawn(move || read_bounded(stdout, max_bytes));
    let stderr_handle = thread::spawn(move || read_bounded(stderr, max_bytes));

    let mut timed_out = false;
    let mut cancelled = false;
    let mut stopped_at: Option<Instant> = None;
    let mut suspended_for = Duration::ZERO;

    let needs_polling =
        opts.timeout.is_some() || opts.cancellation.is_some() || opts.suspended.is_some();
    let status = if needs_polling {
        let poll = Duration::from_millis(50);
        loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if let Some(token) = opts.cancellation.as_ref() {
                if token.is_cancelled() {
                    cancelled = true;
                    break terminate_process_tree(&mut child, opts.kill_grace)?;
                }
            }

            if let Some(flag) = opts.suspended.as_ref() {
                let want_stopped = flag.load(Ordering::SeqCst);
                match (want_stopped, stopped_at) {
                    (true, None) => {
                        signal_group(&child, Signal::Stop);
                        stopped_at = Some(Instant::now());
                        tracing::debug!(target = "weft.process", pid = child.id(), "suspended process");
                    }
                    (false, Some(since)) => {
                        signal_group(&child, Signal::Continue);
                        suspended_for += since.elapsed();
                        stopped_at = None;
                        tracing::debug!(target = "weft.process", pid = child.id(), "resumed process");
                    }
                    _ => {}
                }
            }

            let active = start
                .elapsed()
                .saturating_sub(suspended_for + stopped_at.map_or(Duration::ZERO, |at| at.elapsed()));
            match opts.timeout {
                Some(timeout) if stopped_at.is_none() => {
                    if active >= timeout {
                        timed_out = true;
                        break terminate_process_tree(&mut child, opts.kill_grace)?;
                    }
                    thread::sleep(poll.min(timeout.saturating_sub(active)));
                }
                _ => thread::sleep(poll),
            }
        }
    } else {
        child.wait()?
    };
    if let Some(since) = stopped_at {
        suspended_for += since.elapsed();
    }

    let (stdout_bytes, stdout_truncated) = join_reader(stdout_handle, "stdout")??;
    let (stderr_bytes, stderr_truncated) = join_reader(stderr_handle, "stderr")??;

    let result = ProcessResult {
        status,
        output: BoundedOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
        },
        timed_out,
        cancelled,
        duration: start.elapsed(),
        suspended_for,
    };
    tracing::debug!(
        target = "weft.process",
        command = %spec,
        exit_code = ?result.exit_code(),
        timed_out,
        cancelled,
        duration_ms = result.duration.as_millis() as u64,
        "process exited"
    );
    Ok(result)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Continue,
}

fn signal_group(child: &std::process::Child, signal: Signal) {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        let signal = match signal {
            Signal::Stop => libc::SIGSTOP,
            Signal::Continue => libc::SIGCONT,
        };
        // Negative pid targets the process group created by `setpgid(0, 0)`.
        unsafe {
            let _ = libc::kill(-pid, signal);
        }
    }

    #[cfg(not(unix))]
    {
        static REPORTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
        if REPORTED.set(()).is_ok() {
            tracing::warn!(
                target = "weft.process",
                pid = child.id(),
                ?signal,
                "process suspension is not supported on this platform"
            );
        }
    }
}

fn terminate_process_tree(
    child: &mut std::process::Child,
    grace: Duration,
) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
            // A stopped group cannot act on SIGTERM.
            let _ = libc::kill(-pid, libc::SIGCONT);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `Child::kill()` only terminates the immediate process; `taskkill /T` takes the tree.
        let pid = child.id().to_string();
        let _ = Command::new("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let _ = child.kill();
        child.wait()
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> io::Result<io::Result<(Vec<u8>, bool)>> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{stream} reader thread panicked")))
}

fn read_bounded(mut reader: impl Read, max_bytes: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        if out.len() < max_bytes {
            let to_store = (max_bytes - out.len()).min(n);
            out.extend_from_slice(&buf[..to_store]);
            if to_store < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((out, truncated))
}
