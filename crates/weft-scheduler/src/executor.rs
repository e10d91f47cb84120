use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use weft_config::SandboxSection;
use weft_core::{PathTable, Pip};
use weft_process::{run_process, ProcessSpec, RunOptions};
use weft_resource::PipControl;

use crate::hub::AccessReporter;

/// Everything an executor needs for one attempt of one pip.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub pip: Pip,
    pub path_table: Arc<PathTable>,
    /// 1-based; resource and exit-code retries both count.
    pub attempt: u32,
    /// Must be honoured: cancellation tears the process tree down, suspension pauses it.
    pub control: PipControl,
    pub reporter: AccessReporter,
}

impl ExecutionRequest {
    pub fn program(&self) -> String {
        self.path_table.expand(self.pip.executable).to_string()
    }

    pub fn working_directory(&self) -> String {
        self.path_table.expand(self.pip.working_directory).to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// The executor stopped because the request's control was cancelled.
    pub cancelled: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutcome {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }
}

/// Runs one pip attempt and streams its file accesses to [`ExecutionRequest::reporter`].
///
/// The scheduler closes the access channel once `execute` returns, so every report must have
/// been posted by then.
#[async_trait]
pub trait PipExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> io::Result<ExecutionOutcome>;
}

/// Spawns pips as plain child processes.
///
/// There is no file-access sandbox here, so no accesses are reported and pips run this way
/// only have their declared inputs fingerprinted.
#[derive(Debug, Clone)]
pub struct ProcessPipExecutor {
    kill_grace: Duration,
    max_output_bytes: usize,
}

impl ProcessPipExecutor {
    pub fn new(kill_grace: Duration, max_output_bytes: usize) -> Self {
        Self {
            kill_grace,
            max_output_bytes,
        }
    }

    pub fn from_config(sandbox: &SandboxSection) -> Self {
        Self::new(sandbox.kill_grace(), sandbox.max_output_bytes)
    }
}

#[async_trait]
impl PipExecutor for ProcessPipExecutor {
    async fn execute(&self, request: ExecutionRequest) -> io::Result<ExecutionOutcome> {
        let spec = ProcessSpec::new(request.working_directory(), request.program())
            .args(request.pip.arguments.iter().cloned());
        let spec = request
            .pip
            .environment
            .iter()
            .fold(spec, |spec, (name, value)| spec.env(name.clone(), value.clone()));
        let spec = request
            .pip
            .passthrough_environment
            .iter()
            .fold(spec, |spec, name| spec.passthrough(name.clone()));

        // The scheduler owns the deadline so suspended time can be excluded from it.
        let opts = RunOptions {
            timeout: None,
            max_bytes: self.max_output_bytes,
            cancellation: Some(request.control.cancellation_token()),
            suspended: Some(request.control.suspended_flag()),
            kill_grace: self.kill_grace,
        };

        let pip = request.pip.id;
        let result = tokio::task::spawn_blocking(move || run_process(&spec, opts))
            .await
            .map_err(|err| io::Error::other(format!("{pip}: process task failed: {err}")))??;

        if result.output.truncated {
            tracing::debug!(target = "weft.scheduler", %pip, "process output truncated");
        }
        Ok(ExecutionOutcome {
            exit_code: result.exit_code(),
            cancelled: result.cancelled,
            stdout: result.output.stdout,
            stderr: result.output.stderr,
        })
    }
}
