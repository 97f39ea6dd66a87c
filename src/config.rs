//! Global labvisor configuration.
//!
//! Configuration is resolved from built-in defaults, then an optional TOML
//! file, then command-line overrides applied by the caller.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "labvisor";

/// Config file name inside the config directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Global labvisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LabvisorConfig {
    /// API server settings.
    pub server: ServerConfig,
    /// Lab limits and networking.
    pub lab: LabConfig,
    /// Resource monitor settings.
    pub monitor: MonitorConfig,
    /// Container runtime client settings.
    pub runtime: RuntimeConfig,
    /// VPN provisioner settings.
    pub vpn: VpnConfig,
    /// VM host-port pool.
    pub ports: PortPoolConfig,
}

/// API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub listen: String,
    /// State store path. Defaults to the user data directory.
    pub db_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            db_path: None,
        }
    }
}

/// Lab limits and networking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Runtime network the lab units join.
    pub network_name: String,
    /// Subnet of the lab network (CIDR).
    pub subnet: String,
    /// Public VPN host surfaced in access strings.
    pub vpn_host: String,
    /// Maximum non-terminated labs per user.
    pub max_labs_per_user: usize,
    /// Maximum VMs per lab.
    pub max_vms_per_lab: usize,
    /// Host directory under which per-VM data volumes live.
    pub data_root: PathBuf,
    /// Lifetime applied when a create request omits `expires_at`.
    pub default_duration_hours: u32,
    /// Largest single extension.
    pub max_extend_hours: u32,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            network_name: "lab-network".to_string(),
            subnet: "172.16.0.0/16".to_string(),
            vpn_host: "vpn.labs.local".to_string(),
            max_labs_per_user: 3,
            max_vms_per_lab: 5,
            data_root: PathBuf::from("/data/labs"),
            default_duration_hours: 2,
            max_extend_hours: 24,
        }
    }
}

/// Resource monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between ticks.
    pub check_interval_secs: u64,
    /// CPU overload threshold (percent).
    pub cpu_threshold: f64,
    /// Memory overload threshold (percent).
    pub memory_threshold: f64,
    /// Disk overload threshold (percent).
    pub disk_threshold: f64,
    /// Mount point whose disk usage is sampled.
    pub disk_path: PathBuf,
    /// Expired labs torn down in parallel per sweep.
    pub expire_concurrency: usize,
    /// Reclaim lab-managed units that no live lab owns.
    pub reconcile_orphans: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
            disk_threshold: 90.0,
            disk_path: PathBuf::from("/"),
            expire_concurrency: 4,
            reconcile_orphans: true,
        }
    }
}

impl MonitorConfig {
    /// Tick interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Container runtime client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker CLI binary.
    pub docker_bin: String,
    /// Budget for any single runtime or VPN call.
    pub call_timeout_secs: u64,
    /// Grace period given to a unit on stop.
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            call_timeout_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    /// Budget for any single capability call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Grace period on stop.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// VPN provisioner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// OpenVPN server image.
    pub image: String,
    /// Directory holding server configs and the CA certificate.
    pub server_dir: PathBuf,
    /// Directory holding per-lab client certificates and keys.
    pub client_dir: PathBuf,
    /// First VPN listening port.
    pub base_port: u16,
    /// Number of VPN ports available from `base_port`.
    pub port_range: u16,
    /// Block from which per-lab client pools are carved (a /16).
    pub client_pool: String,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            image: "kylemanna/openvpn".to_string(),
            server_dir: PathBuf::from("/etc/openvpn/server"),
            client_dir: PathBuf::from("/etc/openvpn/client"),
            base_port: 1194,
            port_range: 1000,
            client_pool: "10.8.0.0/16".to_string(),
        }
    }
}

/// Host-port pool for VM forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPoolConfig {
    /// First port of the pool.
    pub vm_port_start: u16,
    /// Last port of the pool (inclusive).
    pub vm_port_end: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            vm_port_start: 20000,
            vm_port_end: 29999,
        }
    }
}

/// Parse an IPv4 CIDR such as `172.16.0.0/16`.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::config("parse subnet", format!("'{}' is not in CIDR form", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| Error::config("parse subnet", format!("'{}': {}", cidr, e)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| Error::config("parse subnet", format!("'{}': {}", cidr, e)))?;
    if prefix > 32 {
        return Err(Error::config(
            "parse subnet",
            format!("prefix /{} out of range", prefix),
        ));
    }
    Ok((addr, prefix))
}

impl LabvisorConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::config("resolve path", "could not determine config directory"))?;
        Ok(dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration.
    ///
    /// With an explicit path the file must exist. Without one the default
    /// location is used, and a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !path.exists() {
            if required {
                return Err(Error::config(
                    "load config",
                    format!("{} does not exist", path.display()),
                ));
            }
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::config("parse config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved state store path.
    pub fn db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.server.db_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| Error::config("resolve path", "could not determine data directory"))?;
        Ok(data_dir.join(APP_NAME).join("labs.redb"))
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            Error::config(
                "parse listen address",
                format!("'{}': {}", self.server.listen, e),
            )
        })
    }

    /// Check the configuration for values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.check_interval_secs == 0 {
            return Err(Error::config(
                "validate monitor",
                "check_interval_secs must be greater than 0",
            ));
        }
        for (name, value) in [
            ("cpu_threshold", self.monitor.cpu_threshold),
            ("memory_threshold", self.monitor.memory_threshold),
            ("disk_threshold", self.monitor.disk_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(Error::config(
                    "validate monitor",
                    format!("{} must be in (0, 100], got {}", name, value),
                ));
            }
        }
        if self.monitor.expire_concurrency == 0 {
            return Err(Error::config(
                "validate monitor",
                "expire_concurrency must be at least 1",
            ));
        }
        if self.lab.network_name.trim().is_empty() {
            return Err(Error::config("validate lab", "network_name cannot be empty"));
        }
        if self.lab.max_vms_per_lab == 0 || self.lab.max_labs_per_user == 0 {
            return Err(Error::config(
                "validate lab",
                "max_vms_per_lab and max_labs_per_user must be at least 1",
            ));
        }
        if self.lab.max_extend_hours == 0 {
            return Err(Error::config("validate lab", "max_extend_hours must be at least 1"));
        }
        let (_, prefix) = parse_cidr(&self.lab.subnet)?;
        if prefix > 16 {
            return Err(Error::config(
                "validate lab",
                format!("subnet {} is too small, need /16 or wider", self.lab.subnet),
            ));
        }
        let (_, pool_prefix) = parse_cidr(&self.vpn.client_pool)?;
        if pool_prefix > 16 {
            return Err(Error::config(
                "validate vpn",
                format!("client_pool {} is too small, need /16 or wider", self.vpn.client_pool),
            ));
        }
        if self.vpn.port_range == 0 || self.vpn.base_port.checked_add(self.vpn.port_range - 1).is_none() {
            return Err(Error::config("validate vpn", "VPN port range is empty or overflows"));
        }
        if self.ports.vm_port_start == 0 || self.ports.vm_port_start > self.ports.vm_port_end {
            return Err(Error::config("validate ports", "VM port pool is empty"));
        }
        if self.runtime.call_timeout_secs == 0 {
            return Err(Error::config(
                "validate runtime",
                "call_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }
}
