use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::{DirectoryArtifact, FileArtifact, PipId};
use crate::path::{AbsolutePath, PathTable};

/// Execution options attached to a pip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipOptions {
    /// Always execute; the result is still stored for later builds.
    #[serde(default)]
    pub disable_cache_lookup: bool,
    /// Exit codes that trigger an automatic re-execution.
    #[serde(default)]
    pub retry_exit_codes: Vec<i32>,
    /// Upper bound on exit-code retries. Resource retries have their own budget.
    #[serde(default)]
    pub max_retries: u32,
    /// Exit codes that count as success.
    #[serde(default = "PipOptions::default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,
    /// Reads of undeclared files on read-only mounts become observed inputs instead of
    /// violations.
    #[serde(default)]
    pub allow_undeclared_source_reads: bool,
    /// Hard wall-clock limit after which the process is torn down.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Memory the pip is expected to need; used to project machine RAM before dispatch.
    #[serde(default)]
    pub expected_ram_mb: u64,
}

impl PipOptions {
    fn default_success_exit_codes() -> Vec<i32> {
        vec![0]
    }

    pub fn is_success(&self, exit_code: i32) -> bool {
        self.success_exit_codes.contains(&exit_code)
    }

    pub fn is_retryable(&self, exit_code: i32) -> bool {
        self.retry_exit_codes.contains(&exit_code)
    }
}

impl Default for PipOptions {
    fn default() -> Self {
        Self {
            disable_cache_lookup: false,
            retry_exit_codes: Vec::new(),
            max_retries: 0,
            success_exit_codes: Self::default_success_exit_codes(),
            allow_undeclared_source_reads: false,
            timeout: None,
            expected_ram_mb: 0,
        }
    }
}

/// A schedulable process invocation with declared inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pip {
    pub id: PipId,
    pub description: String,
    pub executable: AbsolutePath,
    pub arguments: Vec<String>,
    pub working_directory: AbsolutePath,
    /// Ordered: processes can observe the enumeration order of their environment block.
    pub environment: Vec<(String, String)>,
    /// Variables whose values are passed through from the host but not fingerprinted.
    pub passthrough_environment: Vec<String>,
    pub inputs: Vec<FileArtifact>,
    pub input_directories: Vec<DirectoryArtifact>,
    pub outputs: Vec<FileArtifact>,
    pub output_directories: Vec<DirectoryArtifact>,
    pub options: PipOptions,
}

impl Pip {
    pub fn builder(executable: AbsolutePath, working_directory: AbsolutePath) -> PipBuilder {
        PipBuilder::new(executable, working_directory)
    }

    /// Identity computed from the surface that defines what the pip *is*: the command it
    /// runs, the environment it runs in and the files it produces.
    ///
    /// Environment order is left to the weak fingerprint, so reordering variables keeps the
    /// identity but still misses the cache.
    pub fn semantic_id(&self, table: &PathTable) -> PipId {
        let mut fields: Vec<String> = Vec::new();
        fields.push(table.canonical_key(self.executable));
        fields.push(table.canonical_key(self.working_directory));
        fields.push(self.arguments.len().to_string());
        fields.extend(self.arguments.iter().cloned());

        let mut environment: Vec<String> = self
            .environment
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        environment.sort();
        fields.push(environment.len().to_string());
        fields.extend(environment);

        let mut outputs: Vec<String> = self
            .outputs
            .iter()
            .map(|output| format!("{}#{}", table.canonical_key(output.path), output.rewrite_count))
            .chain(
                self.output_directories
                    .iter()
                    .map(|dir| format!("{}/", table.canonical_key(dir.path))),
            )
            .collect();
        outputs.sort();
        fields.extend(outputs);

        PipId::from_identity(fields.iter().map(String::as_str))
    }

    pub fn declares_input(&self, path: AbsolutePath) -> bool {
        self.inputs.iter().any(|input| input.path == path)
    }

    pub fn declares_output(&self, path: AbsolutePath) -> bool {
        self.outputs.iter().any(|output| output.path == path)
    }

    /// Output directory of this pip containing `path`, if any.
    pub fn output_directory_containing(
        &self,
        table: &PathTable,
        path: AbsolutePath,
    ) -> Option<DirectoryArtifact> {
        self.output_directories
            .iter()
            .copied()
            .find(|dir| table.is_within(path, dir.path))
    }
}

/// Fluent constructor for [`Pip`].
#[derive(Debug, Clone)]
pub struct PipBuilder {
    description: String,
    executable: AbsolutePath,
    arguments: Vec<String>,
    working_directory: AbsolutePath,
    environment: Vec<(String, String)>,
    passthrough_environment: Vec<String>,
    inputs: Vec<FileArtifact>,
    input_directories: Vec<DirectoryArtifact>,
    outputs: Vec<FileArtifact>,
    output_directories: Vec<DirectoryArtifact>,
    options: PipOptions,
}

impl PipBuilder {
    pub fn new(executable: AbsolutePath, working_directory: AbsolutePath) -> Self {
        Self {
            description: String::new(),
            executable,
            arguments: Vec::new(),
            working_directory,
            environment: Vec::new(),
            passthrough_environment: Vec::new(),
            inputs: Vec::new(),
            input_directories: Vec::new(),
            outputs: Vec::new(),
            output_directories: Vec::new(),
            options: PipOptions::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((name.into(), value.into()));
        self
    }

    pub fn passthrough_env(mut self, name: impl Into<String>) -> Self {
        self.passthrough_environment.push(name.into());
        self
    }

    pub fn input(mut self, artifact: FileArtifact) -> Self {
        self.inputs.push(artifact);
        self
    }

    pub fn input_directory(mut self, artifact: DirectoryArtifact) -> Self {
        self.input_directories.push(artifact);
        self
    }

    pub fn output(mut self, artifact: FileArtifact) -> Self {
        self.outputs.push(artifact);
        self
    }

    /// Declare an opaque output directory. The graph assigns its seal when the pip is added.
    pub fn output_directory(mut self, path: AbsolutePath) -> Self {
        self.output_directories.push(DirectoryArtifact::unsealed(path));
        self
    }

    pub fn options(mut self, options: PipOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self, table: &PathTable) -> Pip {
        let mut pip = Pip {
            id: PipId::from_raw(0),
            description: self.description,
            executable: self.executable,
            arguments: self.arguments,
            working_directory: self.working_directory,
            environment: self.environment,
            passthrough_environment: self.passthrough_environment,
            inputs: self.inputs,
            input_directories: self.input_directories,
            outputs: self.outputs,
            output_directories: self.output_directories,
            options: self.options,
        };
        pip.id = pip.semantic_id(table);
        if pip.description.is_empty() {
            pip.description = table.file_name(pip.executable);
        }
        pip
    }
}
