use serde::{Deserialize, Serialize};

use crate::perf::MachinePerfInfo;

/// Machine state as seen by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePressure {
    Normal,
    LowMemory,
    /// Not locally recoverable; all pending work fails.
    DiskExhausted,
}

/// Limits for classifying [`MachinePerfInfo`] samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// Enter `LowMemory` when available RAM drops below this.
    pub minimum_available_ram_mb: u64,
    /// Enter `LowMemory` when RAM usage exceeds this.
    pub maximum_ram_usage_percent: f64,
    /// Enter `LowMemory` when commit usage exceeds this.
    pub maximum_commit_usage_percent: f64,
    /// Leave `LowMemory` only once RAM usage is back at or below this.
    pub resume_ram_usage_percent: f64,
    /// Enter `DiskExhausted` when free disk drops below this.
    pub minimum_free_disk_mb: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            minimum_available_ram_mb: 512,
            maximum_ram_usage_percent: 90.0,
            maximum_commit_usage_percent: 95.0,
            resume_ram_usage_percent: 80.0,
            minimum_free_disk_mb: 1024,
        }
    }
}

impl ResourceThresholds {
    /// Classify `sample`, with hysteresis when the previous level was `LowMemory`.
    pub fn classify(&self, sample: &MachinePerfInfo, previous: ResourcePressure) -> ResourcePressure {
        if sample.available_disk_mb < self.minimum_free_disk_mb {
            return ResourcePressure::DiskExhausted;
        }

        let low = sample.available_ram_mb < self.minimum_available_ram_mb
            || sample.ram_usage_percent > self.maximum_ram_usage_percent
            || sample.commit_usage_percent > self.maximum_commit_usage_percent;
        if low {
            return ResourcePressure::LowMemory;
        }

        if previous == ResourcePressure::LowMemory
            && sample.ram_usage_percent > self.resume_ram_usage_percent
        {
            return ResourcePressure::LowMemory;
        }
        ResourcePressure::Normal
    }

    /// Whether `available_ram_mb` out of `total_ram_mb` would be within the limits.
    pub fn ram_ok(&self, available_ram_mb: u64, total_ram_mb: Option<u64>) -> bool {
        if available_ram_mb < self.minimum_available_ram_mb {
            return false;
        }
        match total_ram_mb {
            Some(total) if total > 0 => {
                let used = total.saturating_sub(available_ram_mb) as f64;
                used * 100.0 / total as f64 <= self.maximum_ram_usage_percent
            }
            _ => true,
        }
    }
}
