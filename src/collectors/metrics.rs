use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use sysinfo::{Disks, MINIMUM_CPU_UPDATE_INTERVAL, System};
use tracing::warn;

use super::MetricCollector;
use crate::model::{MetricSample, Reading, UsageInfo};

/// CPU, memory and disk usage through `sysinfo`.
pub struct SysinfoMetrics {
    sys: System,
    disks: Disks,
    disk_root: PathBuf,
    last_cpu_refresh: Instant,
}

impl SysinfoMetrics {
    pub fn new(disk_root: impl Into<PathBuf>) -> Self {
        let mut sys = System::new();
        // First read only primes the counters; utilization needs a second one.
        sys.refresh_cpu_usage();
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            disk_root: disk_root.into(),
            last_cpu_refresh: Instant::now(),
        }
    }

    pub fn disk_root(&self) -> &Path {
        &self.disk_root
    }

    /// Utilization since the previous read. Waits out the remainder of the
    /// minimum update interval when called too soon after the last read, so
    /// the figure always spans a real window.
    fn sample_cpu(&mut self) -> (Reading<f32>, usize) {
        let since = self.last_cpu_refresh.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since);
        }
        self.sys.refresh_cpu_usage();
        self.last_cpu_refresh = Instant::now();

        let count = self.sys.cpus().len();
        if count == 0 {
            return (Reading::unavailable("cpu counters not exposed"), 0);
        }
        let usage = self.sys.global_cpu_usage();
        if !usage.is_finite() {
            return (Reading::unavailable("cpu counters returned garbage"), count);
        }
        (Reading::Sampled((usage * 10.0).round() / 10.0), count)
    }

    fn sample_memory(&mut self) -> Reading<UsageInfo> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return Reading::unavailable("memory counters not exposed");
        }
        Reading::Sampled(UsageInfo::new(total, self.sys.used_memory()))
    }

    fn sample_disk(&mut self) -> Reading<UsageInfo> {
        let root = match std::fs::canonicalize(&self.disk_root) {
            Ok(p) => p,
            Err(e) => {
                warn!(root = %self.disk_root.display(), error = %e, "disk root unreadable");
                return Reading::unavailable(format!("{}: {}", self.disk_root.display(), e));
            }
        };
        self.disks.refresh(true);
        let mounts = self
            .disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space()));
        match usage_for_path(mounts, &root) {
            Some(usage) => Reading::Sampled(usage),
            None => Reading::unavailable(format!("no mounted volume for {}", root.display())),
        }
    }
}

impl MetricCollector for SysinfoMetrics {
    fn sample(&mut self) -> MetricSample {
        let (cpu_percent, cpu_count) = self.sample_cpu();
        MetricSample {
            cpu_percent,
            cpu_count,
            memory: self.sample_memory(),
            disk: self.sample_disk(),
        }
    }
}

/// Usage of the volume whose mount point is the longest prefix of `path`.
/// Volumes reporting zero capacity (pseudo filesystems) are ignored.
fn usage_for_path<'a>(
    mounts: impl Iterator<Item = (&'a Path, u64, u64)>,
    path: &Path,
) -> Option<UsageInfo> {
    mounts
        .filter(|(mount, total, _)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, available)| UsageInfo::new(total, total.saturating_sub(available)))
}
