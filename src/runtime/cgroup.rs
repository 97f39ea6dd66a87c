//! Raw CPU and memory counters from cgroup v2.
//!
//! Reads, for one unit:
//!
//! ```text
//! <unit cgroup>/cpu.stat        usage_usec <value>  (microseconds)
//! <unit cgroup>/memory.current  <bytes>
//! <unit cgroup>/memory.max      <bytes> | max
//! /proc/stat                    cpu <user> <nice> <system> <idle> ...  (USER_HZ ticks)
//! ```
//!
//! Both CPU totals are reported in nanoseconds so their deltas compare
//! directly.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::runtime::UnitStats;

/// Default cgroup v2 mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default location of the kernel CPU accounting file.
pub const DEFAULT_PROC_STAT: &str = "/proc/stat";

/// Kernel clock ticks per second as exposed in `/proc/stat`.
const USER_HZ: u64 = 100;
const NANOS_PER_TICK: u64 = 1_000_000_000 / USER_HZ;

/// Reader of per-unit cgroup counters.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    root: PathBuf,
    proc_stat: PathBuf,
}

impl Default for CgroupReader {
    fn default() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT, DEFAULT_PROC_STAT)
    }
}

impl CgroupReader {
    /// Create a reader over the given cgroup root and `/proc/stat` path.
    pub fn new(root: impl Into<PathBuf>, proc_stat: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            proc_stat: proc_stat.into(),
        }
    }

    /// Locate the cgroup directory of a container by full identity.
    ///
    /// Covers both the systemd (`system.slice/docker-<id>.scope`) and the
    /// cgroupfs (`docker/<id>`) drivers.
    pub fn unit_dir(&self, full_id: &str) -> Option<PathBuf> {
        [
            self.root
                .join("system.slice")
                .join(format!("docker-{}.scope", full_id)),
            self.root.join("docker").join(full_id),
        ]
        .into_iter()
        .find(|p| p.join("cpu.stat").exists())
    }

    /// Sample the counters of the unit whose cgroup lives at `dir`.
    pub fn read_stats(&self, dir: &Path) -> Result<UnitStats> {
        let cpu_stat = read_file(&dir.join("cpu.stat"))?;
        let cpu_usage_total = parse_cpu_stat(&cpu_stat)?;

        let current = read_file(&dir.join("memory.current"))?;
        let mem_usage = parse_u64(current.trim(), "memory.current")?;

        // memory.max is absent on the root cgroup; treat as unlimited.
        let mem_limit = match std::fs::read_to_string(dir.join("memory.max")) {
            Ok(content) => parse_memory_max(&content)?.unwrap_or(0),
            Err(_) => 0,
        };

        let system_cpu_total = parse_proc_stat(&read_file(&self.proc_stat)?)?;

        Ok(UnitStats {
            cpu_usage_total,
            system_cpu_total,
            mem_usage,
            mem_limit,
        })
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::runtime("read cgroup", format!("{}: {}", path.display(), e)))
}

fn parse_u64(value: &str, file: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::runtime("parse cgroup", format!("{}: bad value '{}'", file, value)))
}

/// Cumulative CPU time from `cpu.stat`, in nanoseconds.
pub fn parse_cpu_stat(content: &str) -> Result<u64> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("usage_usec") {
            let value = parts.next().unwrap_or_default();
            return Ok(parse_u64(value, "cpu.stat")?.saturating_mul(1000));
        }
    }
    Err(Error::runtime("parse cgroup", "cpu.stat: usage_usec missing"))
}

/// Memory limit from `memory.max`; `None` when unlimited.
pub fn parse_memory_max(content: &str) -> Result<Option<u64>> {
    match content.trim() {
        "max" => Ok(None),
        value => parse_u64(value, "memory.max").map(Some),
    }
}

/// Total host CPU time from the aggregate `cpu` line of `/proc/stat`, in
/// nanoseconds.
pub fn parse_proc_stat(content: &str) -> Result<u64> {
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| Error::runtime("parse /proc/stat", "aggregate cpu line missing"))?;

    let mut ticks: u64 = 0;
    for field in line.split_whitespace().skip(1) {
        ticks = ticks.saturating_add(parse_u64(field, "/proc/stat")?);
    }
    Ok(ticks.saturating_mul(NANOS_PER_TICK))
}
