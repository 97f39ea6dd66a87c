//! Host resource probe.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use sysinfo::{CpuExt, DiskExt, System, SystemExt};

use crate::config::MonitorConfig;
use crate::error::{Error, Result};

/// Host utilization, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostUsage {
    /// CPU utilization across all cores.
    pub cpu_percent: f64,
    /// Memory in use.
    pub memory_percent: f64,
    /// Space in use on the monitored disk.
    pub disk_percent: f64,
}

impl HostUsage {
    /// Describe every metric above its threshold, or `None` when the host is
    /// within limits.
    pub fn overload(&self, thresholds: &MonitorConfig) -> Option<String> {
        let exceeded: Vec<String> = [
            ("cpu", self.cpu_percent, thresholds.cpu_threshold),
            ("memory", self.memory_percent, thresholds.memory_threshold),
            ("disk", self.disk_percent, thresholds.disk_threshold),
        ]
        .into_iter()
        .filter(|(_, value, limit)| value > limit)
        .map(|(name, value, limit)| format!("{} {:.1}% > {:.1}%", name, value, limit))
        .collect();

        if exceeded.is_empty() {
            None
        } else {
            Some(exceeded.join(", "))
        }
    }
}

/// Resource probe capability. Pure read.
pub trait ResourceProbe: Send + Sync {
    /// Sample host utilization.
    fn host_usage(&self) -> Result<HostUsage>;
}

/// [`ResourceProbe`] backed by `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after construction reads low.
pub struct SysinfoProbe {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SysinfoProbe {
    /// Create a probe watching the disk that holds `disk_path`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_disks_list();
        Self {
            system: Mutex::new(system),
            disk_path: disk_path.into(),
        }
    }
}

impl ResourceProbe for SysinfoProbe {
    fn host_usage(&self) -> Result<HostUsage> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks();

        let cpu_percent = f64::from(system.global_cpu_info().cpu_usage());
        let memory_percent = percent(system.used_memory(), system.total_memory());

        let disk = system
            .disks()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space()))
            .collect::<Vec<_>>();
        let (total, available) = disk_for_path(&self.disk_path, &disk).ok_or_else(|| {
            Error::runtime(
                "probe disk",
                format!("no disk mounted at or above {}", self.disk_path.display()),
            )
        })?;
        let disk_percent = percent(total.saturating_sub(available), total);

        Ok(HostUsage {
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Space of the disk with the longest mount point containing `path`.
fn disk_for_path(path: &Path, disks: &[(&Path, u64, u64)]) -> Option<(u64, u64)> {
    disks
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .map(|(_, total, available)| (*total, *available))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_reports_exceeded_metrics() {
        let thresholds = MonitorConfig::default();
        let calm = HostUsage {
            cpu_percent: 10.0,
            memory_percent: 80.0,
            disk_percent: 50.0,
        };
        assert_eq!(calm.overload(&thresholds), None);

        let hot = HostUsage {
            cpu_percent: 95.0,
            memory_percent: 10.0,
            disk_percent: 91.0,
        };
        let reason = hot.overload(&thresholds).unwrap();
        assert!(reason.contains("cpu 95.0%"));
        assert!(reason.contains("disk 91.0%"));
        assert!(!reason.contains("memory"));
    }

    #[test]
    fn test_disk_for_path_prefers_longest_mount() {
        let disks = [
            (Path::new("/"), 100, 50),
            (Path::new("/data"), 1000, 100),
            (Path::new("/data2"), 10, 10),
        ];
        assert_eq!(disk_for_path(Path::new("/data/labs"), &disks), Some((1000, 100)));
        assert_eq!(disk_for_path(Path::new("/var"), &disks), Some((100, 50)));
        assert_eq!(disk_for_path(Path::new("/var"), &disks[1..]), None);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(1, 0), 0.0);
    }

    #[test]
    fn test_sysinfo_probe_samples_host() {
        let probe = SysinfoProbe::new("/");
        if let Ok(usage) = probe.host_usage() {
            assert!((0.0..=100.0).contains(&usage.memory_percent));
            assert!((0.0..=100.0).contains(&usage.disk_percent));
        }
    }
}
