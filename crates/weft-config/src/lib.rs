use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::prelude::*;
use weft_fingerprint::ObservationPolicy;
use weft_resource::{ManageMemoryMode, ResourceThresholds};

mod validation;

pub use validation::{ConfigValidationError, ConfigWarning, ValidationDiagnostics};

/// Top-level weft configuration loaded from TOML.
///
/// ```toml
/// [scheduler]
/// max_parallelism = 8
/// stop_on_first_failure = true
///
/// [resources]
/// manage_memory_mode = "suspend"
/// minimum_available_ram_mb = 1024
///
/// [sandbox]
/// search_path_tools = ["cl.exe", "link.exe"]
///
/// [fingerprint]
/// salt = "ci-2024"
///
/// [cache]
/// kind = "disk"
/// root = "/var/cache/weft"
///
/// [logging]
/// level = "weft.scheduler=debug,info"
/// json = true
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeftConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub resources: ResourcesSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub fingerprint: FingerprintSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerSection {
    /// Maximum concurrently executing pips. Defaults to the number of CPUs.
    pub max_parallelism: Option<usize>,
    /// Only replay from cache; misses are skipped.
    pub cache_only: bool,
    /// Let dependents of failed pips run anyway.
    pub best_effort: bool,
    /// Skip everything not yet started after the first failure.
    pub stop_on_first_failure: bool,
    /// Capacity of each pip's access-report channel.
    pub access_report_capacity: usize,
    /// Interval between machine performance samples.
    pub perf_sample_interval_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            cache_only: false,
            best_effort: false,
            stop_on_first_failure: false,
            access_report_capacity: 1024,
            perf_sample_interval_ms: 500,
        }
    }
}

impl SchedulerSection {
    pub fn effective_max_parallelism(&self) -> usize {
        self.max_parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn perf_sample_interval(&self) -> Duration {
        Duration::from_millis(self.perf_sample_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourcesSection {
    pub manage_memory_mode: ManageMemoryMode,
    /// Low-memory cancellations a single pip may absorb before it fails.
    pub max_resource_retries: u32,
    pub minimum_available_ram_mb: u64,
    pub maximum_ram_usage_percent: f64,
    pub maximum_commit_usage_percent: f64,
    pub resume_ram_usage_percent: f64,
    pub minimum_free_disk_mb: u64,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        let thresholds = ResourceThresholds::default();
        Self {
            manage_memory_mode: ManageMemoryMode::default(),
            max_resource_retries: 3,
            minimum_available_ram_mb: thresholds.minimum_available_ram_mb,
            maximum_ram_usage_percent: thresholds.maximum_ram_usage_percent,
            maximum_commit_usage_percent: thresholds.maximum_commit_usage_percent,
            resume_ram_usage_percent: thresholds.resume_ram_usage_percent,
            minimum_free_disk_mb: thresholds.minimum_free_disk_mb,
        }
    }
}

impl ResourcesSection {
    pub fn thresholds(&self) -> ResourceThresholds {
        ResourceThresholds {
            minimum_available_ram_mb: self.minimum_available_ram_mb,
            maximum_ram_usage_percent: self.maximum_ram_usage_percent,
            maximum_commit_usage_percent: self.maximum_commit_usage_percent,
            resume_ram_usage_percent: self.resume_ram_usage_percent,
            minimum_free_disk_mb: self.minimum_free_disk_mb,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SandboxSection {
    /// Fail pips that access undeclared files instead of running them uncached.
    pub unexpected_file_accesses_are_errors: bool,
    /// Executable names (e.g. compilers walking include paths) whose enumerations only
    /// fingerprint the entries they go on to read.
    pub search_path_tools: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// Timeout for pips that do not set one.
    pub default_timeout_ms: Option<u64>,
    /// Per-stream cap on captured process output.
    pub max_output_bytes: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            unexpected_file_accesses_are_errors: true,
            search_path_tools: Vec::new(),
            kill_grace_ms: 250,
            default_timeout_ms: None,
            max_output_bytes: 16 * 1024 * 1024,
        }
    }
}

impl SandboxSection {
    pub fn observation_policy(&self) -> ObservationPolicy {
        ObservationPolicy {
            search_path_tools: self.search_path_tools.clone(),
            unexpected_file_accesses_are_errors: self.unexpected_file_accesses_are_errors,
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FingerprintSection {
    /// Mixed into every weak fingerprint; changing it invalidates the whole cache.
    pub salt: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Disk,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSection {
    pub kind: CacheKind,
    /// Root directory of the disk cache. Required when `kind = "disk"`.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl WeftConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber. Later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let fmt_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        } else if cfg!(debug_assertions) {
            // `TestWriter` cooperates with `cargo test` output capture.
            tracing_subscriber::fmt::layer()
                .with_writer(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!(
                target = "weft.config",
                "a global tracing subscriber was already installed"
            );
        }
    });
}
