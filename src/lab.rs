//! Lab and virtual machine records and their lifecycle state machine.
//!
//! A [`Lab`] owns one or more [`VirtualMachine`] records. Both share the
//! [`LabStatus`] domain; VMs only ever use a subset of it.
//!
//! ```text
//! CREATING -> PROVISIONING -> RUNNING <-> WARNING
//!     |             |            |          |
//!     +---> ERROR <-+            +----+-----+
//!             |                       v
//!             +-------------> TERMINATING -> TERMINATED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Lab identity.
pub type LabId = u64;

/// Virtual machine identity.
pub type VmId = u64;

/// User identity (issued by the external identity layer).
pub type UserId = u64;

/// Challenge identity (issued by the external scoring layer).
pub type ChallengeId = u64;

/// Guest port for SSH.
pub const SSH_GUEST_PORT: u16 = 22;

/// Guest port for RDP.
pub const RDP_GUEST_PORT: u16 = 3389;

/// Lifecycle status shared by labs and VMs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LabStatus {
    /// Record exists, nothing provisioned yet.
    #[default]
    Creating,
    /// VPN endpoint and runtime units are being created.
    Provisioning,
    /// Fully provisioned.
    Running,
    /// Running, with an advisory overload diagnostic.
    Warning,
    /// Resources are being released.
    Terminating,
    /// All reachable resources released.
    Terminated,
    /// Provisioning or release failed; must be torn down.
    Error,
}

impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LabStatus::Creating => "creating",
            LabStatus::Provisioning => "provisioning",
            LabStatus::Running => "running",
            LabStatus::Warning => "warning",
            LabStatus::Terminating => "terminating",
            LabStatus::Terminated => "terminated",
            LabStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LabStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Ok(LabStatus::Creating),
            "provisioning" => Ok(LabStatus::Provisioning),
            "running" => Ok(LabStatus::Running),
            "warning" => Ok(LabStatus::Warning),
            "terminating" => Ok(LabStatus::Terminating),
            "terminated" => Ok(LabStatus::Terminated),
            "error" => Ok(LabStatus::Error),
            other => Err(crate::Error::Validation(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

impl LabStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [LabStatus; 7] = [
        LabStatus::Creating,
        LabStatus::Provisioning,
        LabStatus::Running,
        LabStatus::Warning,
        LabStatus::Terminating,
        LabStatus::Terminated,
        LabStatus::Error,
    ];

    /// Whether a lab may move from `self` to `next`.
    pub fn lab_transition_allowed(self, next: LabStatus) -> bool {
        use LabStatus::*;
        matches!(
            (self, next),
            (Creating, Provisioning)
                | (Creating, Error)
                | (Creating, Terminating)
                | (Provisioning, Running)
                | (Provisioning, Error)
                | (Provisioning, Terminating)
                | (Running, Warning)
                | (Running, Terminating)
                | (Warning, Running)
                | (Warning, Terminating)
                | (Terminating, Terminating)
                | (Terminating, Terminated)
                | (Terminating, Error)
                | (Error, Terminating)
        )
    }

    /// Whether a VM may move from `self` to `next`.
    ///
    /// VMs skip the TERMINATING stage: teardown moves each one straight to
    /// TERMINATED once its unit is released, or to ERROR when it is not.
    pub fn vm_transition_allowed(self, next: LabStatus) -> bool {
        use LabStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Creating, Provisioning) | (Creating, Error) => true,
            (Provisioning, Running) | (Provisioning, Error) => true,
            (Running, Warning) | (Warning, Running) => true,
            (Running, Error) | (Warning, Error) | (Terminating, Error) => true,
            _ => false,
        }
    }

    /// Whether the lab counts as live for uniqueness and quota purposes.
    pub fn is_active(self) -> bool {
        self != LabStatus::Terminated
    }

    /// Whether the lab is up (RUNNING or its WARNING sub-state).
    pub fn is_running(self) -> bool {
        matches!(self, LabStatus::Running | LabStatus::Warning)
    }
}

/// Machine type of a VM; selects image and resource limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Ubuntu workstation.
    Ubuntu,
    /// Kali attack box.
    Kali,
    /// Windows target.
    Windows,
    /// Custom machine; runs on the Ubuntu defaults.
    Custom,
}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmType::Ubuntu => "ubuntu",
            VmType::Kali => "kali",
            VmType::Windows => "windows",
            VmType::Custom => "custom",
        };
        f.write_str(s)
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

impl VmType {
    /// Container image backing this machine type.
    pub fn image(self) -> &'static str {
        match self {
            VmType::Kali => "kalilinux/kali-rolling",
            VmType::Windows => "mcr.microsoft.com/windows:ltsc2019",
            VmType::Ubuntu | VmType::Custom => "ubuntu:20.04",
        }
    }

    /// CPU limit in cores.
    pub fn cpu_limit(self) -> u32 {
        match self {
            VmType::Kali | VmType::Windows => 4,
            VmType::Ubuntu | VmType::Custom => 2,
        }
    }

    /// Memory limit in bytes.
    pub fn memory_limit(self) -> u64 {
        match self {
            VmType::Kali => 4 * GIB,
            VmType::Windows => 8 * GIB,
            VmType::Ubuntu | VmType::Custom => 2 * GIB,
        }
    }
}

/// A user's lab: a time-bounded set of VMs behind one VPN endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Lab {
    /// Lab identity.
    pub id: LabId,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Owning user.
    pub owner: UserId,
    /// Originating challenge.
    pub challenge_id: ChallengeId,
    /// Lifecycle status.
    pub status: LabStatus,
    /// Opaque client VPN configuration, set once provisioned.
    #[serde(default)]
    pub vpn_config: Option<String>,
    /// Host port of the lab's VPN endpoint.
    #[serde(default)]
    pub vpn_port: Option<u16>,
    /// Internal network address of the lab.
    #[serde(default)]
    pub internal_ip: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiration time; always after `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Last time access details were fetched.
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Lab {
    /// Whether the lab has passed its expiration time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One compute unit of a lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VirtualMachine {
    /// VM identity.
    pub id: VmId,
    /// Owning lab; never changes after creation.
    pub lab_id: LabId,
    /// Display name, unique within the lab.
    pub name: String,
    /// Machine type.
    pub vm_type: VmType,
    /// Lifecycle status.
    pub status: LabStatus,
    /// Address assigned by the runtime.
    #[serde(default)]
    pub internal_ip: Option<String>,
    /// Host port forwarded to SSH.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Host port forwarded to RDP.
    #[serde(default)]
    pub rdp_port: Option<u16>,
    /// Named guest ports, keyed by name, valued by host port.
    #[serde(default)]
    pub custom_ports: BTreeMap<String, u16>,
    /// Runtime unit backing this VM, set once provisioned.
    #[serde(default)]
    pub unit_id: Option<String>,
    /// Opaque machine configuration.
    #[serde(default)]
    pub vm_config: Option<String>,
    /// Overload note attached while in WARNING.
    #[serde(default)]
    pub diagnostic: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Requested VM, as supplied to `create_lab`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VmSpec {
    /// Display name.
    pub name: String,
    /// Machine type.
    pub vm_type: VmType,
    /// Requested host SSH port; assigned from the pool when absent.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Requested host RDP port; RDP is exposed only when set.
    #[serde(default)]
    pub rdp_port: Option<u16>,
    /// Named host ports, forwarded to the same guest port number.
    #[serde(default)]
    pub custom_ports: BTreeMap<String, u16>,
    /// Opaque machine configuration.
    #[serde(default)]
    pub vm_config: Option<String>,
}

/// Requested lab, as supplied to `create_lab`.
#[derive(Debug, Clone)]
pub struct NewLab {
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Owning user.
    pub owner: UserId,
    /// Originating challenge.
    pub challenge_id: ChallengeId,
    /// Expiration time.
    pub expires_at: DateTime<Utc>,
}

/// Field updates accepted by `update_vm`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VmUpdate {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New host SSH port.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// New host RDP port.
    #[serde(default)]
    pub rdp_port: Option<u16>,
    /// Replacement custom port map.
    #[serde(default)]
    pub custom_ports: Option<BTreeMap<String, u16>>,
    /// Replacement opaque configuration.
    #[serde(default)]
    pub vm_config: Option<String>,
    /// Status change, checked against the VM state machine.
    #[serde(default)]
    pub status: Option<LabStatus>,
}
