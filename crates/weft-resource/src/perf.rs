use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

const MB: u64 = 1024 * 1024;

/// One machine performance sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MachinePerfInfo {
    pub available_ram_mb: u64,
    pub ram_usage_percent: f64,
    pub commit_used_mb: u64,
    pub commit_usage_percent: f64,
    pub available_disk_mb: u64,
}

impl MachinePerfInfo {
    /// Total RAM implied by the sample, if it can be derived.
    pub fn total_ram_mb(&self) -> Option<u64> {
        let free_fraction = 1.0 - self.ram_usage_percent / 100.0;
        if free_fraction <= 0.0 || self.available_ram_mb == 0 {
            return None;
        }
        Some((self.available_ram_mb as f64 / free_fraction).round() as u64)
    }
}

/// Source of periodic machine samples.
pub trait PerformanceSampler: Send + Sync {
    fn sample(&self) -> MachinePerfInfo;
}

/// Samples the real machine through `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SysinfoSampler {
    /// `disk_path` selects the volume whose free space is reported (usually the output root).
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            disk_path: disk_path.into(),
        }
    }

    fn available_disk_mb(&self) -> u64 {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| self.disk_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space() / MB)
            // No matching volume: never report disk exhaustion on a guess.
            .unwrap_or(u64::MAX)
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }
}

impl PerformanceSampler for SysinfoSampler {
    fn sample(&self) -> MachinePerfInfo {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        let used = total.saturating_sub(available);
        let commit_used = used.saturating_add(system.used_swap());
        let commit_limit = total.saturating_add(system.total_swap());
        drop(system);

        MachinePerfInfo {
            available_ram_mb: available / MB,
            ram_usage_percent: percent(used, total),
            commit_used_mb: commit_used / MB,
            commit_usage_percent: percent(commit_used, commit_limit),
            available_disk_mb: self.available_disk_mb(),
        }
    }
}

/// Resident memory of the scheduler process itself, reported alongside machine samples.
pub fn scheduler_rss_bytes() -> Option<u64> {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(err) => {
            tracing::debug!(target = "weft.resource", error = err, "no pid to sample rss for");
            return None;
        }
    };
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).map(|process| process.memory())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64) * 100.0 / (whole as f64)
    }
}
