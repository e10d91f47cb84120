use std::time::Duration;

use weft_config::WeftConfig;
use weft_fingerprint::ObservationPolicy;
use weft_resource::{ManageMemoryMode, ResourceThresholds};

/// Build-wide scheduling policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrently executing pips. Cache lookups and post-processing are not counted.
    pub max_parallelism: usize,
    /// Replay only; a cache miss skips the pip and its dependents.
    pub cache_only: bool,
    /// Dependents of failed pips still run.
    pub best_effort: bool,
    /// After the first failure, nothing that has not started executing will.
    pub stop_on_first_failure: bool,
    pub fingerprint_salt: String,
    pub observation: ObservationPolicy,
    pub thresholds: ResourceThresholds,
    pub manage_memory_mode: ManageMemoryMode,
    pub max_resource_retries: u32,
    pub access_report_capacity: usize,
    /// Only consulted when a performance sampler is attached.
    pub perf_sample_interval: Duration,
    /// Applied to pips without their own timeout.
    pub default_timeout: Option<Duration>,
    /// How long a cancelled executor gets to wind down before it is abandoned.
    pub kill_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&WeftConfig::default())
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &WeftConfig) -> Self {
        Self {
            max_parallelism: config.scheduler.effective_max_parallelism().max(1),
            cache_only: config.scheduler.cache_only,
            best_effort: config.scheduler.best_effort,
            stop_on_first_failure: config.scheduler.stop_on_first_failure,
            fingerprint_salt: config.fingerprint.salt.clone(),
            observation: config.sandbox.observation_policy(),
            thresholds: config.resources.thresholds(),
            manage_memory_mode: config.resources.manage_memory_mode,
            max_resource_retries: config.resources.max_resource_retries,
            access_report_capacity: config.scheduler.access_report_capacity.max(1),
            perf_sample_interval: config.scheduler.perf_sample_interval(),
            default_timeout: config.sandbox.default_timeout(),
            kill_grace: config.sandbox.kill_grace(),
        }
    }
}
