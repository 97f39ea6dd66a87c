//! Resource monitor.
//!
//! The monitor runs as a background task. Each tick it:
//!
//! 1. evicts the oldest running lab when the host is overloaded,
//! 2. flags VMs whose unit is overloaded (WARNING, advisory only),
//! 3. reclaims expired labs,
//! 4. optionally releases orphaned units.
//!
//! A failing step is logged and the tick moves on; only the shutdown signal
//! ends the loop.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::lab::{Lab, LabId, LabStatus, VmId};
use crate::orchestrator::Orchestrator;
use crate::probe::ResourceProbe;
use crate::runtime::{cpu_percent, memory_percent, UnitStats};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Lab evicted for host overload.
    pub evicted: Option<LabId>,
    /// Units found overloaded.
    pub overloaded_units: usize,
    /// Expired labs reclaimed.
    pub expired: usize,
    /// Orphaned units released.
    pub orphans: usize,
}

/// Choose the lab to evict: the oldest running one, lowest identity first
/// on equal creation times.
pub fn select_eviction(labs: &[Lab]) -> Option<&Lab> {
    labs.iter()
        .filter(|lab| lab.status.is_running())
        .min_by_key(|lab| (lab.created_at, lab.id))
}

/// Describe unit overload, or `None` when within limits.
pub fn unit_overload(cpu: f64, memory: f64, config: &MonitorConfig) -> Option<String> {
    let mut reasons = Vec::new();
    if cpu > config.cpu_threshold {
        reasons.push(format!("cpu {:.1}% > {:.1}%", cpu, config.cpu_threshold));
    }
    if memory > config.memory_threshold {
        reasons.push(format!(
            "memory {:.1}% > {:.1}%",
            memory, config.memory_threshold
        ));
    }
    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join(", "))
    }
}

/// Periodic host and unit checks.
pub struct ResourceMonitor {
    orchestrator: Arc<Orchestrator>,
    probe: Arc<dyn ResourceProbe>,
    config: MonitorConfig,
    /// Previous counters per unit, for CPU deltas.
    samples: HashMap<String, UnitStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ResourceMonitor {
    /// Create a new monitor.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        probe: Arc<dyn ResourceProbe>,
        config: MonitorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            probe,
            config,
            samples: HashMap::new(),
            shutdown_rx,
        }
    }

    /// Run the monitor loop.
    ///
    /// This method blocks until shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        // Don't catch up on missed ticks
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval = %humantime::format_duration(self.config.check_interval()),
            "resource monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    tracing::debug!(?summary, "monitor tick complete");
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("resource monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run every check once.
    pub async fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();

        match self.check_host().await {
            Ok(evicted) => summary.evicted = evicted,
            Err(e) => tracing::warn!(error = %e, "host overload check failed"),
        }

        match self.check_units().await {
            Ok(count) => summary.overloaded_units = count,
            Err(e) => tracing::warn!(error = %e, "unit overload check failed"),
        }

        match self.orchestrator.cleanup_expired_labs(Utc::now()).await {
            Ok(count) => summary.expired = count,
            Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
        }

        if self.config.reconcile_orphans {
            match self.orchestrator.reconcile_orphans().await {
                Ok(count) => summary.orphans = count,
                Err(e) => tracing::warn!(error = %e, "orphan reconciliation failed"),
            }
        }

        summary
    }

    async fn check_host(&self) -> Result<Option<LabId>> {
        let probe = Arc::clone(&self.probe);
        let usage = self
            .orchestrator
            .call("probe host", move || probe.host_usage())
            .await?;
        let Some(reason) = usage.overload(&self.config) else {
            return Ok(None);
        };

        let labs = self.orchestrator.store().evictable_labs()?;
        let Some(victim) = select_eviction(&labs) else {
            tracing::warn!(%reason, "host overloaded, no running lab to evict");
            return Ok(None);
        };

        let lab_id = victim.id;
        tracing::info!(lab_id, owner = victim.owner, %reason, "evicting lab to relieve host overload");
        let report = self.orchestrator.teardown(lab_id).await?;
        if !report.is_clean() {
            tracing::warn!(lab_id, failures = report.failures.len(), "eviction left resources behind");
        }
        Ok(Some(lab_id))
    }

    async fn check_units(&mut self) -> Result<usize> {
        let runtime = Arc::clone(self.orchestrator.runtime());
        let units = self
            .orchestrator
            .call("list managed units", move || runtime.list_managed())
            .await?;

        let mut seen = HashSet::new();
        let mut labs = BTreeSet::new();
        let mut overloaded = 0;
        for unit in units.into_iter().filter(|u| u.running) {
            let Some(vm_id) = unit.vm_id() else {
                continue;
            };
            seen.insert(unit.id.clone());

            let runtime = Arc::clone(self.orchestrator.runtime());
            let unit_id = unit.id.clone();
            let stats = match self
                .orchestrator
                .call("unit stats", move || runtime.stats(&unit_id))
                .await
            {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::debug!(unit = %unit.id, error = %e, "skipping unit without stats");
                    continue;
                }
            };

            let cpu = match self.samples.insert(unit.id.clone(), stats) {
                Some(previous) => cpu_percent(&previous, &stats),
                None => 0.0,
            };
            let memory = memory_percent(&stats);
            let overload = unit_overload(cpu, memory, &self.config);
            if overload.is_some() {
                overloaded += 1;
            }

            match self.apply_vm_health(vm_id, overload) {
                Ok(Some(lab_id)) => {
                    labs.insert(lab_id);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(vm_id, error = %e, "vm health not updated"),
            }
        }
        self.samples.retain(|id, _| seen.contains(id));

        for lab_id in labs {
            if let Err(e) = self.sync_lab_health(lab_id) {
                tracing::debug!(lab_id, error = %e, "lab health not updated");
            }
        }
        Ok(overloaded)
    }

    /// Move a VM between RUNNING and WARNING. Returns its lab when the VM is up.
    fn apply_vm_health(&self, vm_id: VmId, overload: Option<String>) -> Result<Option<LabId>> {
        let store = self.orchestrator.store();
        let vm = match store.get_vm(vm_id) {
            Ok(vm) => vm,
            Err(Error::VmNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match (vm.status, overload) {
            (LabStatus::Running, Some(note)) => {
                tracing::warn!(lab_id = vm.lab_id, vm_id, %note, "vm overloaded");
                store.transition_vm(vm_id, &[LabStatus::Running], LabStatus::Warning, |vm| {
                    vm.diagnostic = Some(note)
                })?;
            }
            (LabStatus::Warning, None) => {
                tracing::info!(lab_id = vm.lab_id, vm_id, "vm load back to normal");
                store.transition_vm(vm_id, &[LabStatus::Warning], LabStatus::Running, |vm| {
                    vm.diagnostic = None
                })?;
            }
            (status, _) if !status.is_running() => return Ok(None),
            _ => {}
        }
        Ok(Some(vm.lab_id))
    }

    /// Keep a lab in WARNING while any of its VMs is.
    fn sync_lab_health(&self, lab_id: LabId) -> Result<()> {
        let store = self.orchestrator.store();
        let lab = store.get_lab(lab_id)?;
        let warning = store
            .lab_vms(lab_id)?
            .iter()
            .any(|vm| vm.status == LabStatus::Warning);

        match (lab.status, warning) {
            (LabStatus::Running, true) => {
                store.transition_lab(lab_id, &[LabStatus::Running], LabStatus::Warning)?;
            }
            (LabStatus::Warning, false) => {
                store.transition_lab(lab_id, &[LabStatus::Warning], LabStatus::Running)?;
            }
            _ => {}
        }
        Ok(())
    }
}
