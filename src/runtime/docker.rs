//! Docker-backed container runtime.
//!
//! Drives the `docker` CLI for lifecycle operations and reads resource
//! counters straight from the unit's cgroup.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use super::cgroup::CgroupReader;
use super::{ContainerRuntime, CreatedUnit, UnitInfo, UnitSpec, UnitStats};
use crate::error::{Error, Result};

/// [`ContainerRuntime`] over the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    cgroups: CgroupReader,
}

impl DockerCli {
    /// Create a runtime invoking `bin` (usually `docker`).
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            cgroups: CgroupReader::default(),
        }
    }

    /// Run a docker subcommand and return its trimmed stdout.
    ///
    /// `unit` names the addressed unit so "no such container" failures map
    /// to [`Error::UnitNotFound`].
    fn docker(&self, operation: &str, unit: Option<&str>, args: &[String]) -> Result<String> {
        tracing::debug!(operation, args = ?args, "docker");
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .map_err(|e| Error::runtime(operation, format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Some(unit) = unit {
                if is_not_found(&stderr) {
                    return Err(Error::UnitNotFound(unit.to_string()));
                }
            }
            return Err(Error::runtime(operation, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn inspect(&self, unit_id: &str) -> Result<InspectEntry> {
        let out = self.docker(
            "inspect",
            Some(unit_id),
            &["inspect".into(), "--type".into(), "container".into(), unit_id.into()],
        )?;
        parse_inspect(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))
    }
}

impl ContainerRuntime for DockerCli {
    fn ensure_network(&self, name: &str, subnet: &str) -> Result<()> {
        let exists = self
            .docker(
                "network inspect",
                None,
                &["network".into(), "inspect".into(), name.into()],
            )
            .is_ok();
        if exists {
            tracing::debug!(network = name, "network already present");
            return Ok(());
        }

        self.docker(
            "network create",
            None,
            &[
                "network".into(),
                "create".into(),
                "--driver".into(),
                "bridge".into(),
                "--subnet".into(),
                subnet.into(),
                name.into(),
            ],
        )?;
        tracing::info!(network = name, subnet, "created lab network");
        Ok(())
    }

    fn create(&self, spec: &UnitSpec) -> Result<CreatedUnit> {
        let id = self.docker("run", None, &run_args(spec))?;
        if id.is_empty() {
            return Err(Error::runtime("run", "docker returned no container id"));
        }

        // The unit exists from here on; a failed inspect must not hide its id.
        let internal_ip = match self.inspect(&id) {
            Ok(entry) => entry.ip_address(spec.network.as_deref()),
            Err(e) => {
                tracing::warn!(unit = %id, error = %e, "could not read unit address");
                None
            }
        };

        tracing::info!(unit = %id, name = %spec.name, image = %spec.image, "unit created");
        Ok(CreatedUnit { id, internal_ip })
    }

    fn get(&self, unit_id: &str) -> Result<UnitInfo> {
        Ok(self.inspect(unit_id)?.into_info())
    }

    fn stop(&self, unit_id: &str, timeout: Duration) -> Result<()> {
        self.docker(
            "stop",
            Some(unit_id),
            &[
                "stop".into(),
                "-t".into(),
                timeout.as_secs().to_string(),
                unit_id.into(),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, unit_id: &str) -> Result<()> {
        self.docker(
            "rm",
            Some(unit_id),
            &["rm".into(), "-v".into(), unit_id.into()],
        )?;
        Ok(())
    }

    fn stats(&self, unit_id: &str) -> Result<UnitStats> {
        let entry = self.inspect(unit_id)?;
        if !entry.state.running {
            return Err(Error::runtime("stats", format!("unit {} is not running", unit_id)));
        }
        let dir = self.cgroups.unit_dir(&entry.id).ok_or_else(|| {
            Error::runtime("stats", format!("no cgroup found for unit {}", unit_id))
        })?;
        self.cgroups.read_stats(&dir)
    }

    fn list_labelled(&self, label: &str) -> Result<Vec<UnitInfo>> {
        let ids = self.docker(
            "ps",
            None,
            &[
                "ps".into(),
                "-a".into(),
                "-q".into(),
                "--no-trunc".into(),
                "--filter".into(),
                format!("label={}=true", label),
            ],
        )?;
        let ids: Vec<String> = ids.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string(), "--type".into(), "container".into()];
        args.extend(ids);
        // Units removed between `ps` and `inspect` make the whole call fail;
        // the next tick sees a consistent list.
        let out = self.docker("inspect", None, &args)?;
        Ok(parse_inspect(&out)?
            .into_iter()
            .map(InspectEntry::into_info)
            .collect())
    }
}

/// Arguments of `docker run` for a unit.
fn run_args(spec: &UnitSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".into(),
        "--name".into(),
        spec.name.clone(),
    ];
    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    if spec.cpu_limit > 0 {
        args.push("--cpus".into());
        args.push(spec.cpu_limit.to_string());
    }
    if spec.memory_limit > 0 {
        args.push("--memory".into());
        args.push(format!("{}b", spec.memory_limit));
    }
    for port in &spec.ports {
        args.push("-p".into());
        args.push(format!("{}:{}/{}", port.host, port.guest, spec.protocol.as_str()));
    }
    for volume in &spec.volumes {
        args.push("-v".into());
        args.push(format!("{}:{}", volume.host.display(), volume.guest));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
    for cap in &spec.cap_add {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectEndpoint>>,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

impl InspectEntry {
    /// Address on `network`, or on the first network with one.
    fn ip_address(&self, network: Option<&str>) -> Option<String> {
        let networks = self.network_settings.networks.as_ref()?;
        let preferred = network.and_then(|n| networks.get(n));
        preferred
            .into_iter()
            .chain(networks.values())
            .map(|ep| ep.ip_address.clone())
            .find(|ip| !ip.is_empty())
    }

    fn into_info(self) -> UnitInfo {
        UnitInfo {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            running: self.state.running,
            labels: self.config.labels.unwrap_or_default(),
        }
    }
}

fn parse_inspect(out: &str) -> Result<Vec<InspectEntry>> {
    serde_json::from_str(out).map_err(|e| Error::runtime("parse inspect", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::PortForward;
    use crate::runtime::{Protocol, VolumeMount, LABEL_MANAGED};

    const INSPECT: &str = r#"[
        {
            "Id": "f00dfeed",
            "Name": "/lab-3-vm-7-kali",
            "State": { "Status": "running", "Running": true },
            "Config": { "Labels": { "lab_container": "true", "lab_id": "3", "vm_id": "7" } },
            "NetworkSettings": {
                "Networks": {
                    "bridge": { "IPAddress": "" },
                    "lab-network": { "IPAddress": "172.16.0.9" }
                }
            }
        }
    ]"#;

    #[test]
    fn test_parse_inspect() {
        let entry = parse_inspect(INSPECT).unwrap().pop().unwrap();
        assert_eq!(entry.ip_address(Some("lab-network")).as_deref(), Some("172.16.0.9"));
        assert_eq!(entry.ip_address(None).as_deref(), Some("172.16.0.9"));

        let info = entry.into_info();
        assert_eq!(info.name, "lab-3-vm-7-kali");
        assert!(info.running);
        assert_eq!(info.lab_id(), Some(3));
        assert_eq!(info.vm_id(), Some(7));
    }

    #[test]
    fn test_parse_inspect_without_labels() {
        let json = r#"[{ "Id": "x", "State": { "Running": false }, "Config": { "Labels": null } }]"#;
        let info = parse_inspect(json).unwrap().pop().unwrap().into_info();
        assert!(info.labels.is_empty());
        assert!(!info.running);
    }

    #[test]
    fn test_run_args() {
        let mut spec = UnitSpec {
            name: "lab-1-vm-2-box".into(),
            image: "ubuntu:20.04".into(),
            network: Some("lab-network".into()),
            cpu_limit: 2,
            memory_limit: 1024,
            ports: vec![PortForward { host: 20001, guest: 22 }],
            protocol: Protocol::Tcp,
            volumes: vec![VolumeMount {
                host: "/data/labs/1/box".into(),
                guest: "/lab_data".into(),
            }],
            ..Default::default()
        };
        spec.env.insert("LAB_ID".into(), "1".into());
        spec.labels.insert(LABEL_MANAGED.into(), "true".into());

        let args = run_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name lab-1-vm-2-box --network lab-network"));
        assert!(joined.contains("--cpus 2 --memory 1024b"));
        assert!(joined.contains("-p 20001:22/tcp"));
        assert!(joined.contains("-v /data/labs/1/box:/lab_data"));
        assert!(joined.contains("-e LAB_ID=1"));
        assert!(joined.contains("--label lab_container=true"));
        assert_eq!(args.last().map(String::as_str), Some("ubuntu:20.04"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(is_not_found("Error response from daemon: No such container: abc"));
        assert!(is_not_found("Error: No such object: abc"));
        assert!(!is_not_found("permission denied while trying to connect"));
    }

    #[test]
    fn test_missing_binary_is_runtime_error() {
        let runtime = DockerCli::new("/nonexistent/docker-binary");
        let err = runtime.get("abc").unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }
}
