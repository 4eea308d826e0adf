//! Host resource sensing and the data-loading policy derived from it.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, System};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Datasets are cached in memory at or above this much free RAM.
pub const IN_MEMORY_THRESHOLD_GB: f64 = 32.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub available_memory_gb: f64,
    pub available_disk_gb: f64,
    pub physical_core_count: usize,
}

pub trait ResourceProbe {
    fn probe(&self) -> TrainingResult<ResourceSnapshot>;
}

/// A fixed snapshot probes as itself.
impl ResourceProbe for ResourceSnapshot {
    fn probe(&self) -> TrainingResult<ResourceSnapshot> {
        Ok(*self)
    }
}

/// Reads memory, disk and core counts from the running host.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    disk_path: std::path::PathBuf,
}

impl SystemProbe {
    /// Probe the disk that holds `disk_path`.
    #[must_use]
    pub fn new(disk_path: impl Into<std::path::PathBuf>) -> Self {
        Self { disk_path: disk_path.into() }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(".")
    }
}

impl ResourceProbe for SystemProbe {
    fn probe(&self) -> TrainingResult<ResourceSnapshot> {
        let mut sys = System::new();
        sys.refresh_memory();
        let available_memory_gb = sys.available_memory() as f64 / GIB;

        let physical_core_count = match sys.physical_core_count() {
            Some(cores) => cores,
            None => {
                let logical = std::thread::available_parallelism()
                    .map_err(|e| TrainingError::Resource(format!("core count unavailable: {e}")))?;
                tracing::warn!(logical = logical.get(), "physical core count hidden, using logical cpus");
                logical.get()
            }
        };

        let available_disk_gb = free_disk_gb(&self.disk_path)?;

        Ok(ResourceSnapshot { available_memory_gb, available_disk_gb, physical_core_count })
    }
}

fn free_disk_gb(path: &Path) -> TrainingResult<f64> {
    let target = std::fs::canonicalize(path)
        .map_err(|e| TrainingError::Resource(format!("cannot resolve {}: {e}", path.display())))?;

    let disks = Disks::new_with_refreshed_list();
    let owning = disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match owning {
        Some(disk) => Ok(disk.available_space() as f64 / GIB),
        None => {
            tracing::warn!(path = %target.display(), "no mounted disk owns path, reporting 0 GB free");
            Ok(0.0)
        }
    }
}

/// Platform family that cannot fork loader workers or pin host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_os = "windows") { Self::Windows } else { Self::Unix }
    }

    #[must_use]
    pub fn is_restricted(self) -> bool {
        self == Self::Windows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderPolicy {
    pub keep_in_memory: bool,
    pub num_workers: usize,
    pub pin_memory: bool,
}

impl LoaderPolicy {
    #[must_use]
    pub fn from_snapshot(snapshot: &ResourceSnapshot, platform: Platform) -> Self {
        let keep_in_memory = snapshot.available_memory_gb >= IN_MEMORY_THRESHOLD_GB;

        let num_workers = if platform.is_restricted() {
            0
        } else if snapshot.physical_core_count >= 16 {
            8
        } else {
            snapshot.physical_core_count / 2
        };

        Self { keep_in_memory, num_workers, pin_memory: !platform.is_restricted() }
    }
}
