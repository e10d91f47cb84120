use crate::{CacheKind, LoggingConfig, WeftConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationDiagnostics {
    pub warnings: Vec<ConfigWarning>,
    pub errors: Vec<ConfigValidationError>,
}

impl ValidationDiagnostics {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    InvalidValue { toml_path: String, message: String },
    LoggingLevelInvalid { value: String, normalized: String },
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    InvalidValue { toml_path: String, message: String },
    DiskCacheMissingRoot,
}

impl WeftConfig {
    /// Validate semantic invariants, reporting as many problems as possible in one pass.
    #[must_use]
    pub fn validate(&self) -> ValidationDiagnostics {
        let mut out = ValidationDiagnostics::default();

        validate_scheduler(self, &mut out);
        validate_resources(self, &mut out);
        validate_sandbox(self, &mut out);
        validate_cache(self, &mut out);
        validate_logging(self, &mut out);

        out
    }
}

fn invalid(toml_path: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        toml_path: toml_path.to_string(),
        message: message.to_string(),
    }
}

fn validate_scheduler(config: &WeftConfig, out: &mut ValidationDiagnostics) {
    let scheduler = &config.scheduler;
    if scheduler.max_parallelism == Some(0) {
        out.errors
            .push(invalid("scheduler.max_parallelism", "must be >= 1"));
    }
    if scheduler.access_report_capacity == 0 {
        out.errors
            .push(invalid("scheduler.access_report_capacity", "must be >= 1"));
    }
    if scheduler.perf_sample_interval_ms == 0 {
        out.errors
            .push(invalid("scheduler.perf_sample_interval_ms", "must be >= 1"));
    }
    if scheduler.cache_only && scheduler.best_effort {
        out.warnings.push(ConfigWarning::InvalidValue {
            toml_path: "scheduler.best_effort".to_string(),
            message: "has no effect in cache-only mode".to_string(),
        });
    }
}

fn validate_resources(config: &WeftConfig, out: &mut ValidationDiagnostics) {
    let resources = &config.resources;
    for (toml_path, value) in [
        (
            "resources.maximum_ram_usage_percent",
            resources.maximum_ram_usage_percent,
        ),
        (
            "resources.maximum_commit_usage_percent",
            resources.maximum_commit_usage_percent,
        ),
        (
            "resources.resume_ram_usage_percent",
            resources.resume_ram_usage_percent,
        ),
    ] {
        if !(0.0..=100.0).contains(&value) {
            out.errors
                .push(invalid(toml_path, "must be between 0 and 100"));
        }
    }
    if resources.resume_ram_usage_percent > resources.maximum_ram_usage_percent {
        out.errors.push(invalid(
            "resources.resume_ram_usage_percent",
            "must not exceed resources.maximum_ram_usage_percent",
        ));
    }
}

fn validate_sandbox(config: &WeftConfig, out: &mut ValidationDiagnostics) {
    if config.sandbox.max_output_bytes == 0 {
        out.errors
            .push(invalid("sandbox.max_output_bytes", "must be >= 1"));
    }
    if config.sandbox.default_timeout_ms == Some(0) {
        out.errors
            .push(invalid("sandbox.default_timeout_ms", "must be >= 1"));
    }
    for (idx, tool) in config.sandbox.search_path_tools.iter().enumerate() {
        if tool.trim().is_empty() || tool.contains(['/', '\\']) {
            out.warnings.push(ConfigWarning::InvalidValue {
                toml_path: format!("sandbox.search_path_tools[{idx}]"),
                message: "expected a bare executable file name".to_string(),
            });
        }
    }
}

fn validate_cache(config: &WeftConfig, out: &mut ValidationDiagnostics) {
    if config.cache.kind == CacheKind::Disk && config.cache.root.is_none() {
        out.errors.push(ConfigValidationError::DiskCacheMissingRoot);
    }
}

fn validate_logging(config: &WeftConfig, out: &mut ValidationDiagnostics) {
    let normalized = LoggingConfig::normalize_level_directives(&config.logging.level);
    if !config.logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.warnings.push(ConfigWarning::LoggingLevelInvalid {
            value: config.logging.level.clone(),
            normalized,
        });
    }
}
