//! Network and port allocation for labs.
//!
//! Every live lab leases three kinds of resources:
//!
//! - a VPN listening port, preferring `base_port + lab_id`,
//! - an address slot inside the lab subnet (and the matching VPN client pool),
//! - host ports forwarded to its VMs' SSH, RDP and custom guest ports.
//!
//! Leases are keyed by owner and released at teardown, so identities reused
//! after a restart cannot collide with ports still held by a live lab.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::config::{parse_cidr, LabvisorConfig};
use crate::error::{Error, Result};
use crate::lab::{Lab, LabId, VirtualMachine, VmId, RDP_GUEST_PORT, SSH_GUEST_PORT};

/// Highest usable lab slot (one /24 per slot inside a /16).
const MAX_SLOT: u8 = 254;

/// Network resources leased to one lab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabLease {
    /// VPN listening port on the host.
    pub vpn_port: u16,
    /// Address slot inside the lab subnet.
    pub slot: u8,
    /// Internal address of the lab.
    pub internal_ip: Ipv4Addr,
    /// VPN client pool network (a /24).
    pub client_network: Ipv4Addr,
}

/// A host port forwarded to a guest port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    /// Host side.
    pub host: u16,
    /// Guest side.
    pub guest: u16,
}

/// Host ports leased to one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPorts {
    /// Host port forwarded to SSH.
    pub ssh: u16,
    /// Host port forwarded to RDP, when requested.
    pub rdp: Option<u16>,
    /// Named custom forwards.
    pub custom: BTreeMap<String, PortForward>,
}

impl VmPorts {
    /// All forwards of this VM.
    pub fn forwards(&self) -> Vec<PortForward> {
        let mut out = vec![PortForward {
            host: self.ssh,
            guest: SSH_GUEST_PORT,
        }];
        if let Some(rdp) = self.rdp {
            out.push(PortForward {
                host: rdp,
                guest: RDP_GUEST_PORT,
            });
        }
        out.extend(self.custom.values().cloned());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostPortOwner {
    lab_id: LabId,
    vm_id: VmId,
}

#[derive(Debug, Default)]
struct Leases {
    labs: BTreeMap<LabId, LabLease>,
    vpn_ports: BTreeMap<u16, LabId>,
    slots: BTreeMap<u8, LabId>,
    host_ports: BTreeMap<u16, HostPortOwner>,
}

/// Allocator of VPN ports, lab address blocks and VM host ports.
pub struct Allocator {
    subnet_base: Ipv4Addr,
    client_pool_base: Ipv4Addr,
    vpn_base_port: u16,
    vpn_port_range: u16,
    vm_port_start: u16,
    vm_port_end: u16,
    leases: Mutex<Leases>,
}

impl Allocator {
    /// Create an allocator from configuration.
    pub fn new(config: &LabvisorConfig) -> Result<Self> {
        let (subnet_base, _) = parse_cidr(&config.lab.subnet)?;
        let (client_pool_base, _) = parse_cidr(&config.vpn.client_pool)?;
        Ok(Self {
            subnet_base,
            client_pool_base,
            vpn_base_port: config.vpn.base_port,
            vpn_port_range: config.vpn.port_range,
            vm_port_start: config.ports.vm_port_start,
            vm_port_end: config.ports.vm_port_end,
            leases: Mutex::new(Leases::default()),
        })
    }

    /// Rebuild leases from the labs and VMs that are still live.
    pub fn restore<'a>(
        &self,
        labs: impl IntoIterator<Item = (&'a Lab, &'a [VirtualMachine])>,
    ) {
        let mut leases = self.leases.lock();
        for (lab, vms) in labs {
            if let (Some(vpn_port), Some(ip)) = (lab.vpn_port, lab.internal_ip.as_deref()) {
                match ip.parse::<Ipv4Addr>() {
                    Ok(internal_ip) => {
                        let slot = internal_ip.octets()[2];
                        let lease = LabLease {
                            vpn_port,
                            slot,
                            internal_ip,
                            client_network: self.client_network(slot),
                        };
                        leases.vpn_ports.insert(vpn_port, lab.id);
                        leases.slots.insert(slot, lab.id);
                        leases.labs.insert(lab.id, lease);
                    }
                    Err(e) => {
                        tracing::warn!(lab_id = lab.id, address = %ip, error = %e, "cannot restore lab address lease");
                    }
                }
            }
            for vm in vms {
                if vm.unit_id.is_none() {
                    continue;
                }
                let owner = HostPortOwner {
                    lab_id: lab.id,
                    vm_id: vm.id,
                };
                for port in vm_host_ports(vm) {
                    leases.host_ports.insert(port, owner);
                }
            }
        }
        tracing::debug!(
            labs = leases.labs.len(),
            host_ports = leases.host_ports.len(),
            "allocator restored"
        );
    }

    /// Lease the VPN port and address block of a lab.
    ///
    /// Idempotent: a lab that already holds a lease gets it back unchanged.
    pub fn lease_lab(&self, lab_id: LabId) -> Result<LabLease> {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.labs.get(&lab_id) {
            return Ok(lease.clone());
        }

        let vpn_port = self.pick_vpn_port(&leases, lab_id).ok_or_else(|| {
            Error::Conflict("no free VPN port in the configured range".into())
        })?;
        let slot = (1..=MAX_SLOT)
            .find(|s| !leases.slots.contains_key(s))
            .ok_or_else(|| Error::Conflict("no free lab address block".into()))?;

        let lease = LabLease {
            vpn_port,
            slot,
            internal_ip: self.lab_address(slot),
            client_network: self.client_network(slot),
        };
        leases.vpn_ports.insert(vpn_port, lab_id);
        leases.slots.insert(slot, lab_id);
        leases.labs.insert(lab_id, lease.clone());
        Ok(lease)
    }

    fn pick_vpn_port(&self, leases: &Leases, lab_id: LabId) -> Option<u16> {
        let first = u32::from(self.vpn_base_port);
        let end = first + u32::from(self.vpn_port_range);
        let preferred = u64::from(self.vpn_base_port) + lab_id;
        if preferred < u64::from(end) {
            let port = preferred as u16;
            if !leases.vpn_ports.contains_key(&port) {
                return Some(port);
            }
        }
        (first..end)
            .map(|p| p as u16)
            .find(|p| !leases.vpn_ports.contains_key(p))
    }

    fn lab_address(&self, slot: u8) -> Ipv4Addr {
        let [a, b, _, _] = self.subnet_base.octets();
        Ipv4Addr::new(a, b, slot, 1)
    }

    fn client_network(&self, slot: u8) -> Ipv4Addr {
        let [a, b, _, _] = self.client_pool_base.octets();
        Ipv4Addr::new(a, b, slot, 0)
    }

    /// Reserve the host ports of a VM.
    ///
    /// Requested ports are reserved exactly; a port held by another VM is a
    /// conflict. A missing SSH port is assigned from the pool. Reserving the
    /// same VM twice returns the ports it already holds.
    pub fn reserve_vm_ports(&self, vm: &VirtualMachine) -> Result<VmPorts> {
        let owner = HostPortOwner {
            lab_id: vm.lab_id,
            vm_id: vm.id,
        };
        let mut leases = self.leases.lock();

        let mut requested: Vec<u16> = vm_host_ports(vm);
        requested.sort_unstable();
        requested.dedup();
        for port in &requested {
            if let Some(holder) = leases.host_ports.get(port) {
                if *holder != owner {
                    return Err(Error::Conflict(format!(
                        "host port {} is held by vm {} of lab {}",
                        port, holder.vm_id, holder.lab_id
                    )));
                }
            }
        }

        let ssh = match vm.ssh_port {
            Some(port) => port,
            None => {
                let already = leases
                    .host_ports
                    .iter()
                    .find(|(port, holder)| **holder == owner && !requested.contains(*port))
                    .map(|(port, _)| *port);
                match already {
                    Some(port) => port,
                    None => (self.vm_port_start..=self.vm_port_end)
                        .find(|p| !leases.host_ports.contains_key(p) && !requested.contains(p))
                        .ok_or_else(|| Error::Conflict("VM host-port pool exhausted".into()))?,
                }
            }
        };

        leases.host_ports.insert(ssh, owner);
        for port in requested {
            leases.host_ports.insert(port, owner);
        }

        let custom = vm
            .custom_ports
            .iter()
            .map(|(name, port)| {
                (
                    name.clone(),
                    PortForward {
                        host: *port,
                        guest: *port,
                    },
                )
            })
            .collect();

        Ok(VmPorts {
            ssh,
            rdp: vm.rdp_port,
            custom,
        })
    }

    /// Release the host ports of one VM.
    pub fn release_vm(&self, vm_id: VmId) {
        self.leases
            .lock()
            .host_ports
            .retain(|_, holder| holder.vm_id != vm_id);
    }

    /// Release the VPN port and address block of a lab.
    pub fn release_lab(&self, lab_id: LabId) {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.labs.remove(&lab_id) {
            leases.vpn_ports.remove(&lease.vpn_port);
            leases.slots.remove(&lease.slot);
        }
    }

    /// Current lease of a lab, if any.
    pub fn lab_lease(&self, lab_id: LabId) -> Option<LabLease> {
        self.leases.lock().labs.get(&lab_id).cloned()
    }

    /// Labs holding a network lease.
    pub fn leased_labs(&self) -> Vec<LabId> {
        self.leases.lock().labs.keys().copied().collect()
    }

    /// Number of host ports currently leased.
    pub fn leased_host_ports(&self) -> usize {
        self.leases.lock().host_ports.len()
    }
}

fn vm_host_ports(vm: &VirtualMachine) -> Vec<u16> {
    vm.ssh_port
        .into_iter()
        .chain(vm.rdp_port)
        .chain(vm.custom_ports.values().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::{LabStatus, VmType};
    use chrono::Utc;

    fn allocator() -> Allocator {
        let mut config = LabvisorConfig::default();
        config.vpn.port_range = 4;
        config.ports.vm_port_start = 30000;
        config.ports.vm_port_end = 30002;
        Allocator::new(&config).unwrap()
    }

    fn vm(lab_id: LabId, id: VmId, ssh: Option<u16>, rdp: Option<u16>) -> VirtualMachine {
        VirtualMachine {
            id,
            lab_id,
            name: format!("vm{}", id),
            vm_type: VmType::Ubuntu,
            status: LabStatus::Creating,
            internal_ip: None,
            ssh_port: ssh,
            rdp_port: rdp,
            custom_ports: BTreeMap::new(),
            unit_id: None,
            vm_config: None,
            diagnostic: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_vpn_port_prefers_base_plus_id() {
        let alloc = allocator();
        let lease = alloc.lease_lab(2).unwrap();
        assert_eq!(lease.vpn_port, 1196);
        assert_eq!(lease.internal_ip, Ipv4Addr::new(172, 16, 1, 1));
        assert_eq!(lease.client_network, Ipv4Addr::new(10, 8, 1, 0));

        // Idempotent.
        assert_eq!(alloc.lease_lab(2).unwrap(), lease);
    }

    #[test]
    fn test_vpn_ports_never_collide() {
        let alloc = allocator();
        // Lab 1 prefers 1195; lab 1001 is out of range and falls back.
        let a = alloc.lease_lab(1).unwrap();
        let b = alloc.lease_lab(1001).unwrap();
        let c = alloc.lease_lab(0).unwrap();
        let mut ports = vec![a.vpn_port, b.vpn_port, c.vpn_port];
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 3);
        assert_ne!(a.slot, b.slot);

        alloc.lease_lab(3).unwrap();
        assert!(matches!(alloc.lease_lab(4), Err(Error::Conflict(_))));

        // Releasing frees the port for reuse.
        alloc.release_lab(1);
        assert!(alloc.lab_lease(1).is_none());
        assert_eq!(alloc.lease_lab(4).unwrap().vpn_port, 1195);
    }

    #[test]
    fn test_vm_ports_reserved_and_assigned() {
        let alloc = allocator();
        let ports = alloc.reserve_vm_ports(&vm(1, 1, Some(2201), Some(3390))).unwrap();
        assert_eq!(ports.ssh, 2201);
        assert_eq!(ports.rdp, Some(3390));
        assert_eq!(ports.forwards().len(), 2);

        // Another VM asking for the same host port conflicts.
        assert!(matches!(
            alloc.reserve_vm_ports(&vm(2, 2, Some(2201), None)),
            Err(Error::Conflict(_))
        ));

        // Missing SSH ports come from the pool and are stable per VM.
        let auto = vm(2, 3, None, None);
        let first = alloc.reserve_vm_ports(&auto).unwrap();
        assert_eq!(first.ssh, 30000);
        assert_eq!(alloc.reserve_vm_ports(&auto).unwrap().ssh, 30000);
        assert_eq!(alloc.reserve_vm_ports(&vm(2, 4, None, None)).unwrap().ssh, 30001);

        alloc.release_vm(1);
        alloc.reserve_vm_ports(&vm(2, 2, Some(2201), None)).unwrap();
    }

    #[test]
    fn test_restore_from_live_records() {
        let alloc = allocator();
        let now = Utc::now();
        let lab = Lab {
            id: 9,
            name: "restored".into(),
            description: None,
            owner: 1,
            challenge_id: 1,
            status: LabStatus::Running,
            vpn_config: Some("client".into()),
            vpn_port: Some(1195),
            internal_ip: Some("172.16.5.1".into()),
            created_at: now,
            expires_at: now,
            last_accessed: None,
        };
        let mut running = vm(9, 1, Some(2201), None);
        running.unit_id = Some("unit".into());
        let vms = vec![running];

        alloc.restore([(&lab, vms.as_slice())]);

        assert_eq!(alloc.lab_lease(9).unwrap().slot, 5);
        assert_ne!(alloc.lease_lab(1).unwrap().vpn_port, 1195);
        assert!(alloc.reserve_vm_ports(&vm(1, 2, Some(2201), None)).is_err());
    }
}
