//! Per-lab VPN endpoints.
//!
//! [`VpnProvisioner`] stands up one tunnel endpoint per lab and returns the
//! client configuration users connect with. The returned blob is opaque to
//! the rest of the crate.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::allocator::{LabLease, PortForward};
use crate::config::{parse_cidr, LabvisorConfig};
use crate::error::{Error, Result};
use crate::lab::LabId;
use crate::runtime::{ContainerRuntime, Protocol, UnitSpec, VolumeMount, LABEL_LAB_ID};

/// Port the VPN daemon listens on inside its container.
pub const VPN_GUEST_PORT: u16 = 1194;

/// Label marking VPN endpoint units.
pub const LABEL_VPN: &str = "lab_vpn";

/// VPN provisioner capability.
pub trait VpnProvisioner: Send + Sync {
    /// Start the endpoint of `lab_id` on the leased port and address block,
    /// returning the client configuration. Safe to call again for a lab
    /// whose endpoint already runs.
    fn create_server(&self, lab_id: LabId, lease: &LabLease) -> Result<String>;

    /// Stop the endpoint of `lab_id` and remove its files. An endpoint that
    /// is already gone is not an error.
    fn cleanup_server(&self, lab_id: LabId) -> Result<()>;
}

/// OpenVPN endpoints running as containers next to the lab VMs.
///
/// Certificates are not generated here: the CA and server material must
/// exist in `server_dir`, and per-lab client material
/// (`client_<id>.crt`/`client_<id>.key`, plus `ca.crt`) in `client_dir`.
pub struct OpenVpnProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    server_dir: PathBuf,
    client_dir: PathBuf,
    vpn_host: String,
    network: String,
    lab_subnet: (std::net::Ipv4Addr, u8),
    stop_timeout: Duration,
}

impl OpenVpnProvisioner {
    /// Create a provisioner that starts endpoints through `runtime`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &LabvisorConfig) -> Result<Self> {
        Ok(Self {
            runtime,
            image: config.vpn.image.clone(),
            server_dir: config.vpn.server_dir.clone(),
            client_dir: config.vpn.client_dir.clone(),
            vpn_host: config.lab.vpn_host.clone(),
            network: config.lab.network_name.clone(),
            lab_subnet: parse_cidr(&config.lab.subnet)?,
            stop_timeout: config.runtime.stop_timeout(),
        })
    }

    fn container_name(lab_id: LabId) -> String {
        format!("vpn-lab-{}", lab_id)
    }

    fn server_config_path(&self, lab_id: LabId) -> PathBuf {
        self.server_dir.join(format!("lab_{}.conf", lab_id))
    }

    fn server_config(&self, lease: &LabLease) -> String {
        let (subnet, prefix) = self.lab_subnet;
        let dir = self.server_dir.display();
        format!(
            "port {port}\n\
             proto udp\n\
             dev tun\n\
             ca {dir}/ca.crt\n\
             cert {dir}/server.crt\n\
             key {dir}/server.key\n\
             dh {dir}/dh.pem\n\
             server {pool} 255.255.255.0\n\
             push \"route {subnet} {mask}\"\n\
             keepalive 10 120\n\
             persist-key\n\
             persist-tun\n\
             verb 3\n",
            port = VPN_GUEST_PORT,
            dir = dir,
            pool = lease.client_network,
            subnet = subnet,
            mask = prefix_to_mask(prefix),
        )
    }

    fn client_config(&self, lab_id: LabId, lease: &LabLease) -> Result<String> {
        let ca = read_material(&self.client_dir.join("ca.crt"))?;
        let cert = read_material(&self.client_dir.join(format!("client_{}.crt", lab_id)))?;
        let key = read_material(&self.client_dir.join(format!("client_{}.key", lab_id)))?;
        Ok(format!(
            "client\n\
             dev tun\n\
             proto udp\n\
             remote {host} {port}\n\
             resolv-retry infinite\n\
             nobind\n\
             persist-key\n\
             persist-tun\n\
             remote-cert-tls server\n\
             verb 3\n\
             <ca>\n{ca}\n</ca>\n\
             <cert>\n{cert}\n</cert>\n\
             <key>\n{key}\n</key>\n",
            host = self.vpn_host,
            port = lease.vpn_port,
            ca = ca.trim_end(),
            cert = cert.trim_end(),
            key = key.trim_end(),
        ))
    }

    fn unit_spec(&self, lab_id: LabId, lease: &LabLease) -> UnitSpec {
        let mut spec = UnitSpec {
            name: Self::container_name(lab_id),
            image: self.image.clone(),
            network: Some(self.network.clone()),
            ports: vec![PortForward {
                host: lease.vpn_port,
                guest: VPN_GUEST_PORT,
            }],
            protocol: Protocol::Udp,
            volumes: vec![VolumeMount {
                host: self.server_dir.clone(),
                guest: self.server_dir.display().to_string(),
            }],
            cap_add: vec!["NET_ADMIN".into()],
            command: vec![
                "openvpn".into(),
                "--config".into(),
                self.server_config_path(lab_id).display().to_string(),
            ],
            ..Default::default()
        };
        spec.labels.insert(LABEL_VPN.into(), "true".into());
        spec.labels.insert(LABEL_LAB_ID.into(), lab_id.to_string());
        spec
    }
}

impl VpnProvisioner for OpenVpnProvisioner {
    fn create_server(&self, lab_id: LabId, lease: &LabLease) -> Result<String> {
        // Client material first: nothing is started for a lab that could
        // never connect.
        let client = self.client_config(lab_id, lease)?;

        let conf_path = self.server_config_path(lab_id);
        std::fs::write(&conf_path, self.server_config(lease)).map_err(|e| {
            Error::vpn(
                "write server config",
                format!("{}: {}", conf_path.display(), e),
            )
        })?;

        let name = Self::container_name(lab_id);
        match self.runtime.get(&name) {
            Ok(info) if info.running => {
                tracing::debug!(lab_id, unit = %name, "vpn endpoint already running");
                return Ok(client);
            }
            Ok(_) => {
                // Left over from an earlier attempt; replace it.
                self.runtime.remove(&name)?;
            }
            Err(e) if e.is_unit_not_found() => {}
            Err(e) => return Err(e),
        }

        let unit = self.runtime.create(&self.unit_spec(lab_id, lease))?;
        tracing::info!(lab_id, unit = %unit.id, port = lease.vpn_port, "vpn endpoint started");
        Ok(client)
    }

    fn cleanup_server(&self, lab_id: LabId) -> Result<()> {
        let name = Self::container_name(lab_id);
        let released = self
            .runtime
            .stop(&name, self.stop_timeout)
            .and_then(|_| self.runtime.remove(&name));
        match released {
            Ok(()) => {}
            Err(e) if e.is_unit_not_found() => {
                tracing::debug!(lab_id, unit = %name, "vpn endpoint already gone");
            }
            Err(e) => return Err(e),
        }

        let conf_path = self.server_config_path(lab_id);
        match std::fs::remove_file(&conf_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::vpn(
                "remove server config",
                format!("{}: {}", conf_path.display(), e),
            )),
        }
    }
}

fn read_material(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::vpn(
            "read certificate material",
            format!("{}: {}", path.display(), e),
        )
    })
}

fn prefix_to_mask(prefix: u8) -> std::net::Ipv4Addr {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    std::net::Ipv4Addr::from(bits)
}
