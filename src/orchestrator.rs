//! Lab provisioning and teardown workflows.
//!
//! The [`Orchestrator`] is the only writer of lab network details and unit
//! identities. Every workflow runs inside the lab's exclusive section (see
//! [`LabLocks`]) and moves records with compare-and-set updates, so the
//! request path and the monitor can race on the same lab safely:
//!
//! - provisioning only starts from CREATING,
//! - teardown may start from any status and is idempotent,
//! - a second operation on a busy lab is rejected with [`Error::LabBusy`].
//!
//! Capability calls are blocking. They run on the blocking pool under
//! `call_timeout`; a timed-out call is reported as [`Error::Timeout`] while
//! the blocking thread itself runs to completion in the background.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::allocator::{Allocator, VmPorts};
use crate::config::LabvisorConfig;
use crate::db::LabStore;
use crate::error::{Error, Result};
use crate::lab::{Lab, LabId, LabStatus, VirtualMachine};
use crate::locks::{LabGuard, LabLocks};
use crate::runtime::{
    ContainerRuntime, Protocol, UnitInfo, UnitSpec, VolumeMount, LABEL_LAB_ID, LABEL_MANAGED,
    LABEL_VM_ID,
};
use crate::util::unit_name;
use crate::vpn::{VpnProvisioner, LABEL_VPN};

/// Mount point of the per-VM data directory inside units.
pub const LAB_DATA_MOUNT: &str = "/lab_data";

/// Every status a lab or VM can be torn down from.
const TEARDOWN_FROM: [LabStatus; 6] = [
    LabStatus::Creating,
    LabStatus::Provisioning,
    LabStatus::Running,
    LabStatus::Warning,
    LabStatus::Terminating,
    LabStatus::Error,
];

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Network lab units attach to.
    pub network: String,
    /// Subnet of that network.
    pub subnet: String,
    /// Root of per-VM data directories.
    pub data_root: PathBuf,
    /// Budget of each capability call.
    pub call_timeout: Duration,
    /// Graceful stop period of a unit.
    pub stop_timeout: Duration,
    /// Maximum parallel teardowns in one expiry sweep.
    pub expire_concurrency: usize,
}

impl OrchestratorSettings {
    /// Derive settings from configuration.
    pub fn from_config(config: &LabvisorConfig) -> Self {
        Self {
            network: config.lab.network_name.clone(),
            subnet: config.lab.subnet.clone(),
            data_root: config.lab.data_root.clone(),
            call_timeout: config.runtime.call_timeout(),
            stop_timeout: config.runtime.stop_timeout(),
            expire_concurrency: config.monitor.expire_concurrency,
        }
    }
}

/// One release step that failed during teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseFailure {
    /// What was being released.
    pub step: String,
    /// Why it failed.
    pub error: String,
}

/// Outcome of a teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// The lab.
    pub lab_id: LabId,
    /// The lab was already TERMINATED; only leftovers of an earlier
    /// teardown were retried.
    pub already_terminated: bool,
    /// Units stopped and removed by this teardown.
    pub released_units: Vec<String>,
    /// Release steps that failed; their resources are still held.
    pub failures: Vec<ReleaseFailure>,
}

impl TeardownReport {
    /// Whether every resource was released.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives provisioning and teardown.
pub struct Orchestrator {
    store: Arc<LabStore>,
    runtime: Arc<dyn ContainerRuntime>,
    vpn: Arc<dyn VpnProvisioner>,
    allocator: Arc<Allocator>,
    locks: LabLocks,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        store: Arc<LabStore>,
        runtime: Arc<dyn ContainerRuntime>,
        vpn: Arc<dyn VpnProvisioner>,
        allocator: Arc<Allocator>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            vpn,
            allocator,
            locks: LabLocks::new(),
            settings,
        }
    }

    /// The state store.
    pub fn store(&self) -> &Arc<LabStore> {
        &self.store
    }

    /// The container runtime.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// The per-lab lock table.
    pub fn locks(&self) -> &LabLocks {
        &self.locks
    }

    /// Orchestrator settings.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Rebuild allocator leases from the live labs in the store.
    pub fn restore_allocations(&self) -> Result<usize> {
        let live = self.store.active_labs_with_vms()?;
        self.allocator
            .restore(live.iter().map(|(lab, vms)| (lab, vms.as_slice())));
        Ok(live.len())
    }

    /// Make sure the lab network exists.
    pub async fn ensure_network(&self) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        let name = self.settings.network.clone();
        let subnet = self.settings.subnet.clone();
        self.call("ensure network", move || runtime.ensure_network(&name, &subnet))
            .await
    }

    /// Run a blocking capability call with the configured time budget.
    pub(crate) async fn call<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let timeout = self.settings.call_timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::runtime(
                operation,
                format!("blocking task failed: {}", join_err),
            )),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout,
            }),
        }
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Provision a CREATING lab.
    pub async fn provision(&self, lab_id: LabId) -> Result<Lab> {
        let guard = self.locks.try_acquire(lab_id)?;
        self.provision_guarded(guard).await
    }

    /// Provision the lab held by `guard`.
    ///
    /// On failure the failing VM and the lab move to ERROR. Resources already
    /// created are kept; teardown reclaims them.
    pub async fn provision_guarded(&self, guard: LabGuard) -> Result<Lab> {
        let lab_id = guard.lab_id();
        let lab = self.store.get_lab(lab_id)?;
        if lab.status != LabStatus::Creating {
            return Err(Error::invalid_state(
                LabStatus::Creating.to_string(),
                lab.status.to_string(),
            ));
        }
        let lab = self
            .store
            .transition_lab(lab_id, &[LabStatus::Creating], LabStatus::Provisioning)?;
        tracing::info!(lab_id, owner = lab.owner, "provisioning lab");

        match self.provision_steps(&lab).await {
            Ok(lab) => {
                tracing::info!(lab_id, "lab running");
                Ok(lab)
            }
            Err(e) => {
                tracing::error!(lab_id, error = %e, "lab provisioning failed");
                if let Err(mark_err) =
                    self.store
                        .transition_lab(lab_id, &[LabStatus::Provisioning], LabStatus::Error)
                {
                    tracing::warn!(lab_id, error = %mark_err, "failed to mark lab as error");
                }
                Err(e)
            }
        }
    }

    async fn provision_steps(&self, lab: &Lab) -> Result<Lab> {
        let lab_id = lab.id;
        let lease = self
            .allocator
            .lease_lab(lab_id)
            .map_err(|e| Error::provisioning("allocate lab network", e.to_string()))?;

        let vpn = Arc::clone(&self.vpn);
        let vpn_lease = lease.clone();
        let client_config = self
            .call("create vpn endpoint", move || {
                vpn.create_server(lab_id, &vpn_lease)
            })
            .await
            .map_err(|e| Error::provisioning("create vpn endpoint", e.to_string()))?;

        let lab = self.store.set_lab_network(
            lab_id,
            client_config,
            lease.vpn_port,
            lease.internal_ip.to_string(),
        )?;

        for vm in self.store.lab_vms(lab_id)? {
            if vm.status == LabStatus::Running {
                continue;
            }
            self.provision_vm(&lab, vm).await?;
        }

        self.store
            .transition_lab(lab_id, &[LabStatus::Provisioning], LabStatus::Running)
    }

    async fn provision_vm(&self, lab: &Lab, vm: VirtualMachine) -> Result<VirtualMachine> {
        let vm = self
            .store
            .transition_vm(vm.id, &[LabStatus::Creating], LabStatus::Provisioning, |_| {})?;

        match self.start_unit(lab, &vm).await {
            Ok(vm) => {
                tracing::info!(
                    lab_id = lab.id,
                    vm_id = vm.id,
                    unit = vm.unit_id.as_deref().unwrap_or_default(),
                    "vm running"
                );
                Ok(vm)
            }
            Err(e) => {
                tracing::error!(lab_id = lab.id, vm_id = vm.id, error = %e, "vm provisioning failed");
                let note = e.to_string();
                if let Err(mark_err) = self.store.transition_vm(
                    vm.id,
                    &[LabStatus::Provisioning],
                    LabStatus::Error,
                    |vm| vm.diagnostic = Some(note),
                ) {
                    tracing::warn!(vm_id = vm.id, error = %mark_err, "failed to mark vm as error");
                }
                Err(Error::provisioning(format!("vm {}", vm.name), e.to_string()))
            }
        }
    }

    async fn start_unit(&self, lab: &Lab, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let ports = self.allocator.reserve_vm_ports(vm)?;
        let spec = self.unit_spec(lab, vm, &ports);

        let runtime = Arc::clone(&self.runtime);
        let data_dir = self.data_dir(lab.id, &vm.name);
        let created = self
            .call("create unit", move || {
                std::fs::create_dir_all(&data_dir).map_err(|e| {
                    Error::runtime("create data dir", format!("{}: {}", data_dir.display(), e))
                })?;
                runtime.create(&spec)
            })
            .await?;

        self.store
            .record_vm_unit(vm.id, created.id, created.internal_ip, ports.ssh)?;
        self.store
            .transition_vm(vm.id, &[LabStatus::Provisioning], LabStatus::Running, |vm| {
                vm.diagnostic = None
            })
    }

    fn data_dir(&self, lab_id: LabId, vm_name: &str) -> PathBuf {
        self.settings
            .data_root
            .join(lab_id.to_string())
            .join(vm_name)
    }

    fn unit_spec(&self, lab: &Lab, vm: &VirtualMachine, ports: &VmPorts) -> UnitSpec {
        let mut env = BTreeMap::new();
        env.insert("VM_NAME".to_string(), vm.name.clone());
        env.insert("LAB_ID".to_string(), lab.id.to_string());
        env.insert("VM_TYPE".to_string(), vm.vm_type.to_string());

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_LAB_ID.to_string(), lab.id.to_string());
        labels.insert(LABEL_VM_ID.to_string(), vm.id.to_string());

        UnitSpec {
            name: unit_name(lab.id, vm.id, &vm.name),
            image: vm.vm_type.image().to_string(),
            network: Some(self.settings.network.clone()),
            cpu_limit: vm.vm_type.cpu_limit(),
            memory_limit: vm.vm_type.memory_limit(),
            ports: ports.forwards(),
            protocol: Protocol::Tcp,
            volumes: vec![VolumeMount {
                host: self.data_dir(lab.id, &vm.name),
                guest: LAB_DATA_MOUNT.to_string(),
            }],
            env,
            labels,
            cap_add: Vec::new(),
            command: Vec::new(),
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear down a lab.
    pub async fn teardown(&self, lab_id: LabId) -> Result<TeardownReport> {
        let guard = self.locks.try_acquire(lab_id)?;
        self.teardown_guarded(guard).await
    }

    /// Tear down the lab held by `guard`.
    ///
    /// Release steps are best-effort: a failing step is logged and recorded
    /// in the report, and the remaining steps still run. The lab always ends
    /// TERMINATED unless that final update itself cannot be stored. VMs whose
    /// unit could not be released are left in ERROR with their unit id.
    ///
    /// On a TERMINATED lab only those leftovers are retried: VMs not yet
    /// TERMINATED and a VPN endpoint whose lease is still held. Units already
    /// released are not touched again.
    pub async fn teardown_guarded(&self, guard: LabGuard) -> Result<TeardownReport> {
        let lab_id = guard.lab_id();
        let mut report = TeardownReport {
            lab_id,
            ..Default::default()
        };

        let lab = self.store.get_lab(lab_id)?;
        if lab.status == LabStatus::Terminated {
            report.already_terminated = true;
            self.release_leftovers(lab_id, &mut report).await?;
            tracing::debug!(
                lab_id,
                released = report.released_units.len(),
                failures = report.failures.len(),
                "lab already terminated"
            );
            return Ok(report);
        }
        self.store
            .transition_lab(lab_id, &TEARDOWN_FROM, LabStatus::Terminating)?;
        tracing::info!(lab_id, from = %lab.status, "tearing down lab");

        for vm in self.store.lab_vms(lab_id)? {
            if vm.status == LabStatus::Terminated {
                continue;
            }
            self.release_vm(&vm, &mut report).await;
        }
        self.release_vpn(lab_id, &mut report).await;

        self.store
            .transition_lab(lab_id, &[LabStatus::Terminating], LabStatus::Terminated)?;
        tracing::info!(
            lab_id,
            released = report.released_units.len(),
            failures = report.failures.len(),
            "lab terminated"
        );
        Ok(report)
    }

    async fn release_leftovers(&self, lab_id: LabId, report: &mut TeardownReport) -> Result<()> {
        for vm in self.store.lab_vms(lab_id)? {
            if vm.status != LabStatus::Terminated {
                self.release_vm(&vm, report).await;
            }
        }
        if self.allocator.lab_lease(lab_id).is_some() {
            self.release_vpn(lab_id, report).await;
        }
        Ok(())
    }

    /// Remove the VPN endpoint; its network lease is freed only once it is gone.
    async fn release_vpn(&self, lab_id: LabId, report: &mut TeardownReport) {
        let vpn = Arc::clone(&self.vpn);
        match self
            .call("cleanup vpn endpoint", move || vpn.cleanup_server(lab_id))
            .await
        {
            Ok(()) => self.allocator.release_lab(lab_id),
            Err(e) => {
                tracing::warn!(lab_id, error = %e, "vpn endpoint cleanup failed");
                report.failures.push(ReleaseFailure {
                    step: "vpn endpoint".into(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn release_vm(&self, vm: &VirtualMachine, report: &mut TeardownReport) {
        // A VM that reached PROVISIONING may have a unit that was never
        // recorded (e.g. a timed-out create); look it up by name.
        let key = match (&vm.unit_id, vm.status) {
            (Some(unit_id), _) => Some(unit_id.clone()),
            (None, LabStatus::Provisioning | LabStatus::Error) => {
                Some(unit_name(vm.lab_id, vm.id, &vm.name))
            }
            (None, _) => None,
        };

        let released = match &key {
            Some(key) => self.release_unit(key.clone()).await,
            None => Ok(false),
        };

        match released {
            Ok(removed) => {
                if removed {
                    if let Some(key) = key {
                        report.released_units.push(key);
                    }
                }
                self.allocator.release_vm(vm.id);
                if let Err(e) =
                    self.store
                        .transition_vm(vm.id, &TEARDOWN_FROM, LabStatus::Terminated, |_| {})
                {
                    tracing::warn!(vm_id = vm.id, error = %e, "failed to mark vm terminated");
                    report.failures.push(ReleaseFailure {
                        step: format!("vm {} record", vm.name),
                        error: e.to_string(),
                    });
                }
            }
            Err(e) => {
                tracing::warn!(lab_id = vm.lab_id, vm_id = vm.id, error = %e, "unit release failed");
                let note = e.to_string();
                let current = self.store.get_vm(vm.id).map(|v| v.status);
                if let Ok(status) = current {
                    if status != LabStatus::Error {
                        if let Err(mark_err) =
                            self.store
                                .transition_vm(vm.id, &[status], LabStatus::Error, |vm| {
                                    vm.diagnostic = Some(note)
                                })
                        {
                            tracing::warn!(vm_id = vm.id, error = %mark_err, "failed to mark vm as error");
                        }
                    }
                }
                report.failures.push(ReleaseFailure {
                    step: format!("vm {} unit", vm.name),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Stop and remove a unit. Returns `false` when it was already gone.
    async fn release_unit(&self, key: String) -> Result<bool> {
        let runtime = Arc::clone(&self.runtime);
        let stop_timeout = self.settings.stop_timeout;
        self.call("release unit", move || {
            match runtime.stop(&key, stop_timeout) {
                Ok(()) => {}
                Err(e) if e.is_unit_not_found() => return Ok(false),
                Err(e) => return Err(e),
            }
            match runtime.remove(&key) {
                Ok(()) => Ok(true),
                Err(e) if e.is_unit_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Tear down every expired, non-terminated lab.
    ///
    /// Distinct labs are torn down in parallel, up to `expire_concurrency`
    /// at a time. Labs busy with another operation are skipped until the
    /// next sweep. Returns the number of labs this sweep terminated.
    pub async fn cleanup_expired_labs(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.expired_labs(now)?;
        if expired.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = expired.len(), "reclaiming expired labs");

        let permits = Arc::new(Semaphore::new(self.settings.expire_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for lab in expired {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (lab.id, Err(Error::runtime("expiry sweep", "semaphore closed")));
                };
                (lab.id, this.teardown(lab.id).await)
            });
        }

        let mut terminated = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((lab_id, Ok(report))) => {
                    if !report.already_terminated {
                        terminated += 1;
                        tracing::info!(lab_id, clean = report.is_clean(), "expired lab reclaimed");
                    }
                }
                Ok((lab_id, Err(Error::LabBusy(_)))) => {
                    tracing::debug!(lab_id, "expired lab busy, retrying next sweep");
                }
                Ok((lab_id, Err(e))) => {
                    tracing::warn!(lab_id, error = %e, "expired lab teardown failed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "expiry task failed");
                }
            }
        }
        Ok(terminated)
    }

    /// Release managed units and VPN endpoints whose lab is gone or
    /// TERMINATED.
    ///
    /// Returns the number of units and endpoints released.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        let runtime = Arc::clone(&self.runtime);
        let units = self
            .call("list managed units", move || runtime.list_managed())
            .await?;

        let mut released = 0;
        for unit in units {
            let Some(lab_id) = unit.lab_id() else {
                continue;
            };
            if !self.is_orphaned(lab_id)? {
                continue;
            }
            let Ok(_guard) = self.locks.try_acquire(lab_id) else {
                continue;
            };

            match self.release_unit(unit.id.clone()).await {
                Ok(_) => {
                    released += 1;
                    tracing::info!(lab_id, unit = %unit.id, "released orphaned unit");
                    self.settle_orphan_vm(lab_id, &unit)?;
                }
                Err(e) => {
                    tracing::warn!(lab_id, unit = %unit.id, error = %e, "orphaned unit release failed");
                }
            }
        }

        released += self.reconcile_vpn_endpoints().await?;
        Ok(released)
    }

    /// Retry endpoint cleanup for labs that still run one or still hold a
    /// network lease after teardown.
    async fn reconcile_vpn_endpoints(&self) -> Result<usize> {
        let runtime = Arc::clone(&self.runtime);
        let endpoints = self
            .call("list vpn endpoints", move || runtime.list_labelled(LABEL_VPN))
            .await?;
        let candidates: BTreeSet<LabId> = endpoints
            .iter()
            .filter_map(UnitInfo::lab_id)
            .chain(self.allocator.leased_labs())
            .collect();

        let mut released = 0;
        for lab_id in candidates {
            if !self.is_orphaned(lab_id)? {
                continue;
            }
            let Ok(_guard) = self.locks.try_acquire(lab_id) else {
                continue;
            };

            let vpn = Arc::clone(&self.vpn);
            match self
                .call("cleanup vpn endpoint", move || vpn.cleanup_server(lab_id))
                .await
            {
                Ok(()) => {
                    self.allocator.release_lab(lab_id);
                    released += 1;
                    tracing::info!(lab_id, "released orphaned vpn endpoint");
                }
                Err(e) => {
                    tracing::warn!(lab_id, error = %e, "orphaned vpn endpoint cleanup failed");
                }
            }
        }
        Ok(released)
    }

    fn is_orphaned(&self, lab_id: LabId) -> Result<bool> {
        match self.store.get_lab(lab_id) {
            Ok(lab) => Ok(lab.status == LabStatus::Terminated),
            Err(Error::LabNotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Mark the VM behind a released orphan unit TERMINATED and free its
    /// host ports.
    ///
    /// The record naming the unit wins; a unit whose id was never recorded
    /// (a timed-out create) is matched through its VM label.
    fn settle_orphan_vm(&self, lab_id: LabId, unit: &UnitInfo) -> Result<()> {
        let vm = match self.store.find_vm_by_unit(&unit.id)? {
            Some(vm) => vm,
            None => {
                let Some(vm_id) = unit.vm_id() else {
                    return Ok(());
                };
                match self.store.get_vm(vm_id) {
                    Ok(vm) => vm,
                    // Records of a removed lab are gone with it.
                    Err(Error::VmNotFound(_)) => {
                        self.allocator.release_vm(vm_id);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if vm.lab_id != lab_id || vm.status == LabStatus::Terminated {
            return Ok(());
        }

        self.allocator.release_vm(vm.id);
        if let Err(e) = self
            .store
            .transition_vm(vm.id, &TEARDOWN_FROM, LabStatus::Terminated, |vm| {
                vm.diagnostic = None
            })
        {
            tracing::warn!(vm_id = vm.id, error = %e, "failed to mark vm terminated");
        }
        Ok(())
    }
}
