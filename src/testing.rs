//! In-process fakes of the external capabilities, for tests.
//!
//! Every fake records the calls it receives so tests can assert how often a
//! destructive operation was issued.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::allocator::LabLease;
use crate::error::{Error, Result};
use crate::lab::LabId;
use crate::probe::{HostUsage, ResourceProbe};
use crate::runtime::{ContainerRuntime, CreatedUnit, UnitInfo, UnitSpec, UnitStats};
use crate::vpn::VpnProvisioner;

#[derive(Debug, Clone)]
struct FakeUnit {
    name: String,
    running: bool,
    labels: BTreeMap<String, String>,
    stats: UnitStats,
}

#[derive(Debug, Default)]
struct RuntimeState {
    next_id: u64,
    units: BTreeMap<String, FakeUnit>,
    created: Vec<UnitSpec>,
    calls: Vec<(String, String)>,
    removed: Vec<String>,
    networks: Vec<String>,
    fail_create: HashSet<String>,
    fail_remove: HashSet<String>,
    create_delay: Option<Duration>,
}

impl RuntimeState {
    fn resolve(&self, key: &str) -> Option<String> {
        if self.units.contains_key(key) {
            return Some(key.to_string());
        }
        self.units
            .iter()
            .find(|(_, unit)| unit.name == key)
            .map(|(id, _)| id.clone())
    }
}

/// Container runtime that keeps units in memory.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail for units whose name contains `pattern`.
    pub fn fail_create(&self, pattern: &str) {
        self.state.lock().fail_create.insert(pattern.to_string());
    }

    /// Make `remove` fail for the given unit id or name.
    pub fn fail_remove(&self, key: &str) {
        self.state.lock().fail_remove.insert(key.to_string());
    }

    /// Drop every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_create.clear();
        state.fail_remove.clear();
    }

    /// Let `create` block for `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = Some(delay);
    }

    /// Insert a unit that was not created through this fake.
    pub fn add_unit(&self, id: &str, name: &str, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state.lock().units.insert(
            id.to_string(),
            FakeUnit {
                name: name.to_string(),
                running: true,
                labels,
                stats: UnitStats::default(),
            },
        );
    }

    /// Set the counters reported by `stats`.
    pub fn set_stats(&self, unit_id: &str, stats: UnitStats) {
        if let Some(unit) = self.state.lock().units.get_mut(unit_id) {
            unit.stats = stats;
        }
    }

    /// Specs passed to successful `create` calls.
    pub fn created(&self) -> Vec<UnitSpec> {
        self.state.lock().created.clone()
    }

    /// Keys passed to successful `remove` calls.
    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    /// Number of `stop`/`remove` invocations, successful or not.
    pub fn destructive_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(op, _)| op == "stop" || op == "remove")
            .count()
    }

    /// Destructive invocations addressed to `key`.
    pub fn destructive_calls_for(&self, key: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(op, k)| (op == "stop" || op == "remove") && k == key)
            .count()
    }

    /// Identities of units that still exist.
    pub fn live_units(&self) -> Vec<String> {
        self.state.lock().units.keys().cloned().collect()
    }

    /// Networks passed to `ensure_network`.
    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.clone()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn ensure_network(&self, name: &str, _subnet: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.networks.iter().any(|n| n == name) {
            state.networks.push(name.to_string());
        }
        Ok(())
    }

    fn create(&self, spec: &UnitSpec) -> Result<CreatedUnit> {
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        state.calls.push(("create".into(), spec.name.clone()));
        if state.fail_create.iter().any(|p| spec.name.contains(p.as_str())) {
            return Err(Error::runtime("run", format!("injected failure for {}", spec.name)));
        }
        if state.resolve(&spec.name).is_some() {
            return Err(Error::runtime("run", format!("name {} already in use", spec.name)));
        }
        state.next_id += 1;
        let id = format!("unit-{}", state.next_id);
        let ip = format!("172.16.0.{}", state.next_id + 1);
        state.units.insert(
            id.clone(),
            FakeUnit {
                name: spec.name.clone(),
                running: true,
                labels: spec.labels.clone(),
                stats: UnitStats::default(),
            },
        );
        state.created.push(spec.clone());
        Ok(CreatedUnit {
            id,
            internal_ip: Some(ip),
        })
    }

    fn get(&self, unit_id: &str) -> Result<UnitInfo> {
        let state = self.state.lock();
        let id = state
            .resolve(unit_id)
            .ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))?;
        let unit = &state.units[&id];
        Ok(UnitInfo {
            id: id.clone(),
            name: unit.name.clone(),
            running: unit.running,
            labels: unit.labels.clone(),
        })
    }

    fn stop(&self, unit_id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(("stop".into(), unit_id.to_string()));
        let id = state
            .resolve(unit_id)
            .ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))?;
        if let Some(unit) = state.units.get_mut(&id) {
            unit.running = false;
        }
        Ok(())
    }

    fn remove(&self, unit_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(("remove".into(), unit_id.to_string()));
        let id = state
            .resolve(unit_id)
            .ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))?;
        if state.fail_remove.contains(unit_id) || state.fail_remove.contains(&id) {
            return Err(Error::runtime("rm", format!("injected failure for {}", unit_id)));
        }
        state.units.remove(&id);
        state.removed.push(unit_id.to_string());
        Ok(())
    }

    fn stats(&self, unit_id: &str) -> Result<UnitStats> {
        let state = self.state.lock();
        let id = state
            .resolve(unit_id)
            .ok_or_else(|| Error::UnitNotFound(unit_id.to_string()))?;
        Ok(state.units[&id].stats)
    }

    fn list_labelled(&self, label: &str) -> Result<Vec<UnitInfo>> {
        let state = self.state.lock();
        Ok(state
            .units
            .iter()
            .filter(|(_, unit)| unit.labels.get(label).map(String::as_str) == Some("true"))
            .map(|(id, unit)| UnitInfo {
                id: id.clone(),
                name: unit.name.clone(),
                running: unit.running,
                labels: unit.labels.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct VpnState {
    servers: BTreeMap<LabId, LabLease>,
    create_calls: usize,
    cleanup_calls: Vec<LabId>,
    fail_create: bool,
    fail_cleanup: bool,
}

/// VPN provisioner that hands out fixed client blobs.
#[derive(Debug, Default)]
pub struct FakeVpn {
    state: Mutex<VpnState>,
}

impl FakeVpn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `create_server` fail.
    pub fn fail_create(&self) {
        self.state.lock().fail_create = true;
    }

    /// Make every `cleanup_server` fail.
    pub fn fail_cleanup(&self) {
        self.state.lock().fail_cleanup = true;
    }

    /// Drop every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_create = false;
        state.fail_cleanup = false;
    }

    /// Number of `create_server` invocations.
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    /// Labs passed to `cleanup_server`.
    pub fn cleanup_calls(&self) -> Vec<LabId> {
        self.state.lock().cleanup_calls.clone()
    }

    /// Labs with a live endpoint.
    pub fn live_servers(&self) -> Vec<LabId> {
        self.state.lock().servers.keys().copied().collect()
    }
}

impl VpnProvisioner for FakeVpn {
    fn create_server(&self, lab_id: LabId, lease: &LabLease) -> Result<String> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.fail_create {
            return Err(Error::vpn("create server", "injected failure"));
        }
        state.servers.insert(lab_id, lease.clone());
        Ok(format!("client-config-lab-{}-port-{}", lab_id, lease.vpn_port))
    }

    fn cleanup_server(&self, lab_id: LabId) -> Result<()> {
        let mut state = self.state.lock();
        state.cleanup_calls.push(lab_id);
        if state.fail_cleanup {
            return Err(Error::vpn("cleanup server", "injected failure"));
        }
        state.servers.remove(&lab_id);
        Ok(())
    }
}

/// Probe reporting a settable host usage.
#[derive(Debug, Default)]
pub struct FakeProbe {
    usage: Mutex<HostUsage>,
    fail: Mutex<bool>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_usage(&self, usage: HostUsage) {
        *self.usage.lock() = usage;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

impl ResourceProbe for FakeProbe {
    fn host_usage(&self) -> Result<HostUsage> {
        if *self.fail.lock() {
            return Err(Error::runtime("probe", "injected failure"));
        }
        Ok(*self.usage.lock())
    }
}
