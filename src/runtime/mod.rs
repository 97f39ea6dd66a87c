//! Container runtime capability.
//!
//! The orchestrator drives compute units through [`ContainerRuntime`]. Calls
//! are blocking; async callers run them on the blocking pool with a timeout.
//! `get` and friends report a missing unit as [`Error::UnitNotFound`] so
//! teardown can treat "already gone" as success.
//!
//! [`Error::UnitNotFound`]: crate::Error::UnitNotFound

pub mod cgroup;
pub mod docker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::allocator::PortForward;
use crate::error::Result;

pub use docker::DockerCli;

/// Label marking units created by labvisor.
pub const LABEL_MANAGED: &str = "lab_container";
/// Label carrying the owning lab identity.
pub const LABEL_LAB_ID: &str = "lab_id";
/// Label carrying the owning VM identity.
pub const LABEL_VM_ID: &str = "vm_id";

/// A host directory bound into a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Host path.
    pub host: PathBuf,
    /// Path inside the unit.
    pub guest: String,
}

/// Transport of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// TCP (default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Everything needed to start one unit.
#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    /// Unit name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Network to attach to.
    pub network: Option<String>,
    /// CPU limit in cores (0 = unlimited).
    pub cpu_limit: u32,
    /// Memory limit in bytes (0 = unlimited).
    pub memory_limit: u64,
    /// Forwarded ports.
    pub ports: Vec<PortForward>,
    /// Transport of every forwarded port.
    pub protocol: Protocol,
    /// Bound host directories.
    pub volumes: Vec<VolumeMount>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Extra capabilities (e.g. `NET_ADMIN`).
    pub cap_add: Vec<String>,
    /// Command override.
    pub command: Vec<String>,
}

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedUnit {
    /// Runtime identity of the unit.
    pub id: String,
    /// Address assigned on the unit network, if any.
    pub internal_ip: Option<String>,
}

/// Observed state of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    /// Runtime identity.
    pub id: String,
    /// Unit name.
    pub name: String,
    /// Whether the unit is running.
    pub running: bool,
    /// Unit labels.
    pub labels: BTreeMap<String, String>,
}

impl UnitInfo {
    /// Lab identity from the unit labels.
    pub fn lab_id(&self) -> Option<u64> {
        self.labels.get(LABEL_LAB_ID)?.parse().ok()
    }

    /// VM identity from the unit labels.
    pub fn vm_id(&self) -> Option<u64> {
        self.labels.get(LABEL_VM_ID)?.parse().ok()
    }
}

/// Raw resource counters of a unit.
///
/// CPU totals are cumulative; two samples are needed for a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitStats {
    /// Cumulative CPU time consumed by the unit.
    pub cpu_usage_total: u64,
    /// Cumulative CPU time of the whole host, same unit as above.
    pub system_cpu_total: u64,
    /// Current memory usage in bytes.
    pub mem_usage: u64,
    /// Memory limit in bytes.
    pub mem_limit: u64,
}

/// CPU percentage between two samples of the same unit.
///
/// A non-advancing system counter yields 0%.
pub fn cpu_percent(previous: &UnitStats, current: &UnitStats) -> f64 {
    let cpu_delta = current.cpu_usage_total.saturating_sub(previous.cpu_usage_total);
    let system_delta = current.system_cpu_total.saturating_sub(previous.system_cpu_total);
    if system_delta == 0 {
        return 0.0;
    }
    cpu_delta as f64 / system_delta as f64 * 100.0
}

/// Memory usage as a percentage of the limit; 0% without a limit.
pub fn memory_percent(stats: &UnitStats) -> f64 {
    if stats.mem_limit == 0 {
        return 0.0;
    }
    stats.mem_usage as f64 / stats.mem_limit as f64 * 100.0
}

/// Container runtime capability.
pub trait ContainerRuntime: Send + Sync {
    /// Create the named network with `subnet` unless it exists.
    fn ensure_network(&self, name: &str, subnet: &str) -> Result<()>;

    /// Create and start a unit.
    fn create(&self, spec: &UnitSpec) -> Result<CreatedUnit>;

    /// Inspect a unit.
    fn get(&self, unit_id: &str) -> Result<UnitInfo>;

    /// Stop a unit, waiting up to `timeout` before killing it.
    fn stop(&self, unit_id: &str, timeout: Duration) -> Result<()>;

    /// Remove a stopped unit.
    fn remove(&self, unit_id: &str) -> Result<()>;

    /// Sample raw counters of a running unit.
    fn stats(&self, unit_id: &str) -> Result<UnitStats>;

    /// Units whose `label` is set to `true`, running or not.
    fn list_labelled(&self, label: &str) -> Result<Vec<UnitInfo>>;

    /// Units carrying the managed label.
    fn list_managed(&self) -> Result<Vec<UnitInfo>> {
        self.list_labelled(LABEL_MANAGED)
    }
}
