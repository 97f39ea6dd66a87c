//! Lab service: the request-facing surface of the core.
//!
//! Every operation takes the [`Caller`] on whose behalf it runs and checks
//! ownership before touching a lab. Provisioning and deletion return as soon
//! as the work is handed to a background task; their effects live in the
//! store, so a caller that goes away does not leave them half applied.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::config::LabConfig;
use crate::db::{LabLimits, LabStore};
use crate::error::{Error, Result};
use crate::lab::{
    ChallengeId, Lab, LabId, LabStatus, NewLab, UserId, VirtualMachine, VmId, VmSpec, VmType,
    VmUpdate,
};
use crate::orchestrator::Orchestrator;
use crate::util::format_remaining;
use crate::validation::{
    validate_display_name, validate_extend_hours, validate_vm_specs, validate_vm_update,
};

/// Identity of the user a request runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// User identity.
    pub user_id: UserId,
    /// Privileged caller.
    pub admin: bool,
}

impl Caller {
    /// Regular user.
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            admin: false,
        }
    }

    /// Privileged user.
    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            admin: true,
        }
    }

    fn authorize(&self, lab: &Lab) -> Result<()> {
        if self.admin || lab.owner == self.user_id {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "user {} does not own lab {}",
                self.user_id, lab.id
            )))
        }
    }

    fn require_admin(&self, action: &str) -> Result<()> {
        if self.admin {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} requires an administrator",
                action
            )))
        }
    }
}

/// Request to create a lab.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateLab {
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Originating challenge.
    pub challenge_id: ChallengeId,
    /// Requested VMs.
    pub vms: Vec<VmSpec>,
    /// Expiration time; defaults to the configured lab lifetime.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Connection details for one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VmAccess {
    pub vm_id: VmId,
    pub name: String,
    pub vm_type: VmType,
    pub status: LabStatus,
    /// `ssh -p <port> user@<vpn_host>`.
    pub ssh: Option<String>,
    /// `<vpn_host>:<port>`.
    pub rdp: Option<String>,
    /// Named ports as `<vpn_host>:<port>`.
    pub custom: BTreeMap<String, String>,
}

/// Everything a user needs to reach a lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct LabAccess {
    pub lab_id: LabId,
    /// Opaque client configuration issued by the VPN provisioner.
    pub vpn_config: String,
    pub vpn_host: String,
    pub vpn_port: Option<u16>,
    pub vms: Vec<VmAccess>,
}

/// Status of one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VmStatusView {
    pub vm_id: VmId,
    pub name: String,
    pub vm_type: VmType,
    pub status: LabStatus,
    pub internal_ip: Option<String>,
    pub ssh_port: Option<u16>,
    pub rdp_port: Option<u16>,
    pub custom_ports: BTreeMap<String, u16>,
    /// Overload note while in WARNING, failure cause in ERROR.
    pub diagnostic: Option<String>,
}

impl From<&VirtualMachine> for VmStatusView {
    fn from(vm: &VirtualMachine) -> Self {
        Self {
            vm_id: vm.id,
            name: vm.name.clone(),
            vm_type: vm.vm_type,
            status: vm.status,
            internal_ip: vm.internal_ip.clone(),
            ssh_port: vm.ssh_port,
            rdp_port: vm.rdp_port,
            custom_ports: vm.custom_ports.clone(),
            diagnostic: vm.diagnostic.clone(),
        }
    }
}

/// Status of a lab and its VMs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct LabStatusView {
    pub lab_id: LabId,
    pub status: LabStatus,
    pub expires_at: DateTime<Utc>,
    /// Whole seconds until expiration; 0 once expired.
    pub remaining_seconds: i64,
    /// Human-readable remaining time.
    pub remaining: String,
    pub vms: Vec<VmStatusView>,
}

/// Lab operations on behalf of callers.
pub struct LabService {
    orchestrator: Arc<Orchestrator>,
    config: LabConfig,
}

impl LabService {
    /// Create a new service.
    pub fn new(orchestrator: Arc<Orchestrator>, config: LabConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// The orchestrator behind this service.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn store(&self) -> &LabStore {
        self.orchestrator.store()
    }

    fn limits(&self) -> LabLimits {
        LabLimits {
            max_labs_per_user: self.config.max_labs_per_user,
            max_vms_per_lab: self.config.max_vms_per_lab,
        }
    }

    fn authorized_lab(&self, caller: &Caller, lab_id: LabId) -> Result<Lab> {
        let lab = self.store().get_lab(lab_id)?;
        caller.authorize(&lab)?;
        Ok(lab)
    }

    /// Create a lab owned by the caller and start provisioning it.
    ///
    /// Returns the CREATING records and the provisioning task.
    pub fn create_lab(
        &self,
        caller: &Caller,
        request: CreateLab,
    ) -> Result<(Lab, Vec<VirtualMachine>, JoinHandle<()>)> {
        validate_display_name(&request.name, "lab")?;
        validate_vm_specs(&request.vms, self.config.max_vms_per_lab)?;

        let now = Utc::now();
        let expires_at = request.expires_at.unwrap_or_else(|| {
            now + ChronoDuration::hours(i64::from(self.config.default_duration_hours))
        });

        let (lab, vms) = self.store().create_lab(
            NewLab {
                name: request.name,
                description: request.description,
                owner: caller.user_id,
                challenge_id: request.challenge_id,
                expires_at,
            },
            request.vms,
            self.limits(),
            now,
        )?;
        tracing::info!(
            lab_id = lab.id,
            owner = lab.owner,
            challenge_id = lab.challenge_id,
            vms = vms.len(),
            "lab created"
        );

        // Nobody else knows the lab yet, so the guard is free.
        let guard = self.orchestrator.locks().try_acquire(lab.id)?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let task = tokio::spawn(async move {
            let lab_id = guard.lab_id();
            if let Err(e) = orchestrator.provision_guarded(guard).await {
                tracing::warn!(lab_id, error = %e, "lab provisioning failed");
            }
        });

        Ok((lab, vms, task))
    }

    /// Tear a lab down and remove its records.
    ///
    /// Records are removed only after a clean teardown; otherwise the lab
    /// stays TERMINATED with its unreleased VMs in ERROR. Rejected with
    /// [`Error::LabBusy`] while another operation holds the lab.
    pub fn delete_lab(&self, caller: &Caller, lab_id: LabId) -> Result<(Lab, JoinHandle<()>)> {
        let lab = self.authorized_lab(caller, lab_id)?;
        let guard = self.orchestrator.locks().try_acquire(lab_id)?;

        let orchestrator = Arc::clone(&self.orchestrator);
        let task = tokio::spawn(async move {
            match orchestrator.teardown_guarded(guard).await {
                Ok(report) if report.is_clean() => {
                    if let Err(e) = orchestrator.store().remove_lab(lab_id) {
                        tracing::warn!(lab_id, error = %e, "failed to remove lab records");
                    } else {
                        tracing::info!(lab_id, "lab deleted");
                    }
                }
                Ok(report) => tracing::warn!(
                    lab_id,
                    failures = report.failures.len(),
                    "lab torn down with leftovers, keeping records"
                ),
                Err(e) => tracing::warn!(lab_id, error = %e, "lab teardown failed"),
            }
        });

        Ok((lab, task))
    }

    /// Push the expiration of a lab by `hours`.
    pub fn extend_lab(&self, caller: &Caller, lab_id: LabId, hours: u32) -> Result<Lab> {
        validate_extend_hours(hours, self.config.max_extend_hours)?;
        self.authorized_lab(caller, lab_id)?;
        let lab = self.store().extend_lab(lab_id, hours, Utc::now())?;
        tracing::info!(lab_id, hours, expires_at = %lab.expires_at, "lab extended");
        Ok(lab)
    }

    /// VPN configuration and per-VM access strings.
    ///
    /// Available once the VPN endpoint exists. Stamps the last access time.
    pub fn lab_access(&self, caller: &Caller, lab_id: LabId) -> Result<LabAccess> {
        let lab = self.authorized_lab(caller, lab_id)?;
        if lab.status == LabStatus::Terminated {
            return Err(Error::invalid_state("an active lab", lab.status.to_string()));
        }
        let Some(vpn_config) = lab.vpn_config.clone() else {
            return Err(Error::invalid_state(
                "a lab with a vpn endpoint",
                lab.status.to_string(),
            ));
        };

        let host = &self.config.vpn_host;
        let vms = self
            .store()
            .lab_vms(lab_id)?
            .iter()
            .filter(|vm| vm.status != LabStatus::Terminated)
            .map(|vm| VmAccess {
                vm_id: vm.id,
                name: vm.name.clone(),
                vm_type: vm.vm_type,
                status: vm.status,
                ssh: vm.ssh_port.map(|port| format!("ssh -p {} user@{}", port, host)),
                rdp: vm.rdp_port.map(|port| format!("{}:{}", host, port)),
                custom: vm
                    .custom_ports
                    .iter()
                    .map(|(name, port)| (name.clone(), format!("{}:{}", host, port)))
                    .collect(),
            })
            .collect();

        self.store().touch_lab(lab_id, Utc::now())?;
        Ok(LabAccess {
            lab_id,
            vpn_config,
            vpn_host: host.clone(),
            vpn_port: lab.vpn_port,
            vms,
        })
    }

    /// Lab status, remaining time and VM states.
    pub fn lab_status(&self, caller: &Caller, lab_id: LabId) -> Result<LabStatusView> {
        let lab = self.authorized_lab(caller, lab_id)?;
        let now = Utc::now();
        let vms = self.store().lab_vms(lab_id)?;
        Ok(LabStatusView {
            lab_id,
            status: lab.status,
            expires_at: lab.expires_at,
            remaining_seconds: (lab.expires_at - now).num_seconds().max(0),
            remaining: format_remaining(lab.expires_at, now),
            vms: vms.iter().map(VmStatusView::from).collect(),
        })
    }

    /// A lab and its VMs.
    pub fn get_lab(&self, caller: &Caller, lab_id: LabId) -> Result<(Lab, Vec<VirtualMachine>)> {
        let lab = self.authorized_lab(caller, lab_id)?;
        let vms = self.store().lab_vms(lab_id)?;
        Ok((lab, vms))
    }

    /// Labs visible to the caller: their own, or all of them for an admin.
    pub fn list_labs(&self, caller: &Caller, include_expired: bool) -> Result<Vec<Lab>> {
        if caller.admin {
            let now = Utc::now();
            let mut labs = self.store().list_labs()?;
            labs.retain(|lab| include_expired || !lab.is_expired(now));
            Ok(labs)
        } else {
            self.store()
                .labs_for_user(caller.user_id, include_expired, Utc::now())
        }
    }

    /// Update VM fields. Admin only.
    pub fn update_vm(
        &self,
        caller: &Caller,
        lab_id: LabId,
        vm_id: VmId,
        update: VmUpdate,
    ) -> Result<VirtualMachine> {
        caller.require_admin("updating a vm")?;
        validate_vm_update(&update)?;

        if let Some(name) = &update.name {
            let taken = self
                .store()
                .lab_vms(lab_id)?
                .iter()
                .any(|vm| vm.id != vm_id && vm.name.eq_ignore_ascii_case(name));
            if taken {
                return Err(Error::Validation(format!("duplicate vm name '{}'", name)));
            }
        }

        let vm = self.store().update_vm(lab_id, vm_id, update)?;
        tracing::info!(lab_id, vm_id, "vm updated");
        Ok(vm)
    }

    /// Reclaim every expired lab now. Admin only.
    pub async fn cleanup_expired(&self, caller: &Caller) -> Result<usize> {
        caller.require_admin("cleaning up expired labs")?;
        self.orchestrator.cleanup_expired_labs(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::config::LabvisorConfig;
    use crate::orchestrator::OrchestratorSettings;
    use crate::testing::{FakeRuntime, FakeVpn};

    struct Harness {
        service: LabService,
        runtime: Arc<FakeRuntime>,
        _data: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let data = tempfile::tempdir().unwrap();
        let mut config = LabvisorConfig::default();
        config.lab.data_root = data.path().to_path_buf();
        let runtime = Arc::new(FakeRuntime::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(LabStore::open_in_memory().unwrap()),
            runtime.clone(),
            Arc::new(FakeVpn::new()),
            Arc::new(Allocator::new(&config).unwrap()),
            OrchestratorSettings::from_config(&config),
        ));
        Harness {
            service: LabService::new(orchestrator, config.lab),
            runtime,
            _data: data,
        }
    }

    fn vm(name: &str, rdp: Option<u16>) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            vm_type: VmType::Ubuntu,
            ssh_port: None,
            rdp_port: rdp,
            custom_ports: BTreeMap::new(),
            vm_config: None,
        }
    }

    fn request(challenge_id: ChallengeId) -> CreateLab {
        CreateLab {
            name: "Web 101".into(),
            description: None,
            challenge_id,
            vms: vec![vm("attacker", None), vm("target", Some(33890))],
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        }
    }

    async fn running_lab(h: &Harness, caller: &Caller, challenge_id: ChallengeId) -> LabId {
        let (lab, _, task) = h.service.create_lab(caller, request(challenge_id)).unwrap();
        task.await.unwrap();
        lab.id
    }

    #[tokio::test]
    async fn test_create_lab_provisions_in_background() {
        let h = harness();
        let alice = Caller::user(1);

        let (lab, vms, task) = h.service.create_lab(&alice, request(7)).unwrap();
        assert_eq!(lab.status, LabStatus::Creating);
        assert_eq!(lab.owner, 1);
        assert_eq!(vms.len(), 2);
        assert!(vms
            .iter()
            .all(|vm| vm.status == LabStatus::Creating && vm.unit_id.is_none()));

        task.await.unwrap();
        let (lab, vms) = h.service.get_lab(&alice, lab.id).unwrap();
        assert_eq!(lab.status, LabStatus::Running);
        for vm in &vms {
            assert_eq!(vm.status, LabStatus::Running);
            assert!(vm.unit_id.is_some());
            assert!(vm.internal_ip.is_some());
        }
    }

    #[tokio::test]
    async fn test_create_lab_defaults_expiration() {
        let h = harness();
        let mut req = request(7);
        req.expires_at = None;
        let before = Utc::now();
        let (lab, _, _task) = h.service.create_lab(&Caller::user(1), req).unwrap();
        assert!(lab.expires_at >= before + ChronoDuration::hours(2));
        assert!(lab.expires_at <= Utc::now() + ChronoDuration::hours(2));
    }

    #[tokio::test]
    async fn test_duplicate_lab_rejected() {
        let h = harness();
        let alice = Caller::user(1);
        running_lab(&h, &alice, 7).await;

        let err = h.service.create_lab(&alice, request(7)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(h.service.list_labs(&alice, true).unwrap().len(), 1);

        // Another challenge is fine.
        running_lab(&h, &alice, 8).await;
        assert_eq!(h.service.list_labs(&alice, true).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_lab_rejects_invalid_request() {
        let h = harness();
        let mut req = request(7);
        req.vms.push(vm("Attacker", None));
        assert!(matches!(
            h.service.create_lab(&Caller::user(1), req),
            Err(Error::Validation(_))
        ));

        let mut req = request(7);
        req.name = " ".into();
        assert!(matches!(
            h.service.create_lab(&Caller::user(1), req),
            Err(Error::Validation(_))
        ));
        assert!(h.service.list_labs(&Caller::admin(99), true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permissions() {
        let h = harness();
        let alice = Caller::user(1);
        let bob = Caller::user(2);
        let lab_id = running_lab(&h, &alice, 7).await;

        assert!(matches!(
            h.service.get_lab(&bob, lab_id),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            h.service.lab_access(&bob, lab_id),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            h.service.extend_lab(&bob, lab_id, 1),
            Err(Error::PermissionDenied(_))
        ));
        assert!(h.service.list_labs(&bob, true).unwrap().is_empty());

        assert!(h.service.get_lab(&Caller::admin(99), lab_id).is_ok());
        assert_eq!(h.service.list_labs(&Caller::admin(99), true).unwrap().len(), 1);
        assert!(matches!(
            h.service.get_lab(&alice, 404),
            Err(Error::LabNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_extend_lab() {
        let h = harness();
        let alice = Caller::user(1);
        let lab_id = running_lab(&h, &alice, 7).await;
        let before = h.service.get_lab(&alice, lab_id).unwrap().0.expires_at;

        let lab = h.service.extend_lab(&alice, lab_id, 3).unwrap();
        assert_eq!(lab.expires_at - before, ChronoDuration::hours(3));

        assert!(matches!(
            h.service.extend_lab(&alice, lab_id, 0),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            h.service.extend_lab(&alice, lab_id, 25),
            Err(Error::Validation(_))
        ));

        h.service.orchestrator().teardown(lab_id).await.unwrap();
        assert!(matches!(
            h.service.extend_lab(&alice, lab_id, 1),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(
            h.service.get_lab(&alice, lab_id).unwrap().0.expires_at,
            lab.expires_at
        );
    }

    #[tokio::test]
    async fn test_lab_access() {
        let h = harness();
        let alice = Caller::user(1);

        // Not provisioned yet: the task never gets to run.
        let (lab, _, task) = h.service.create_lab(&alice, request(7)).unwrap();
        task.abort();
        let _ = task.await;
        assert!(matches!(
            h.service.lab_access(&alice, lab.id),
            Err(Error::InvalidState { .. })
        ));

        let lab_id = running_lab(&h, &alice, 8).await;
        let access = h.service.lab_access(&alice, lab_id).unwrap();
        assert!(access.vpn_config.starts_with("client-config-lab-"));
        assert_eq!(access.vms.len(), 2);

        let attacker = access.vms.iter().find(|v| v.name == "attacker").unwrap();
        let port = attacker.ssh.as_ref().unwrap();
        assert!(port.starts_with("ssh -p "));
        assert!(port.ends_with(" user@vpn.labs.local"));
        assert!(attacker.rdp.is_none());

        let target = access.vms.iter().find(|v| v.name == "target").unwrap();
        assert_eq!(target.rdp.as_deref(), Some("vpn.labs.local:33890"));

        let lab = h.service.get_lab(&alice, lab_id).unwrap().0;
        assert!(lab.last_accessed.is_some());
    }

    #[tokio::test]
    async fn test_lab_status() {
        let h = harness();
        let alice = Caller::user(1);
        let lab_id = running_lab(&h, &alice, 7).await;

        let status = h.service.lab_status(&alice, lab_id).unwrap();
        assert_eq!(status.status, LabStatus::Running);
        assert!(status.remaining_seconds > 3500 && status.remaining_seconds <= 3600);
        assert_eq!(status.vms.len(), 2);
        assert!(status.vms.iter().all(|vm| vm.ssh_port.is_some()));
    }

    #[tokio::test]
    async fn test_delete_lab_removes_records() {
        let h = harness();
        let alice = Caller::user(1);
        let lab_id = running_lab(&h, &alice, 7).await;
        assert_eq!(h.runtime.live_units().len(), 2);

        let (lab, task) = h.service.delete_lab(&alice, lab_id).unwrap();
        assert_eq!(lab.id, lab_id);
        task.await.unwrap();

        assert!(matches!(
            h.service.get_lab(&alice, lab_id),
            Err(Error::LabNotFound(_))
        ));
        assert!(h.runtime.live_units().is_empty());

        // The challenge is free again.
        running_lab(&h, &alice, 7).await;
    }

    #[tokio::test]
    async fn test_delete_lab_keeps_records_after_partial_teardown() {
        let h = harness();
        let alice = Caller::user(1);
        let lab_id = running_lab(&h, &alice, 7).await;
        let unit = h.service.get_lab(&alice, lab_id).unwrap().1[0]
            .unit_id
            .clone()
            .unwrap();
        h.runtime.fail_remove(&unit);

        let (_, task) = h.service.delete_lab(&alice, lab_id).unwrap();
        task.await.unwrap();

        let (lab, vms) = h.service.get_lab(&alice, lab_id).unwrap();
        assert_eq!(lab.status, LabStatus::Terminated);
        assert!(vms.iter().any(|vm| vm.status == LabStatus::Error));

        // Deleting again retries the stuck unit and keeps the records while
        // it still runs.
        let (_, task) = h.service.delete_lab(&alice, lab_id).unwrap();
        task.await.unwrap();
        assert!(h.service.get_lab(&alice, lab_id).is_ok());
        assert!(h.runtime.live_units().contains(&unit));

        h.runtime.clear_failures();
        let (_, task) = h.service.delete_lab(&alice, lab_id).unwrap();
        task.await.unwrap();
        assert!(!h.runtime.live_units().contains(&unit));
        assert!(matches!(
            h.service.get_lab(&alice, lab_id),
            Err(Error::LabNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_busy_lab_rejected() {
        let h = harness();
        let alice = Caller::user(1);
        let lab_id = running_lab(&h, &alice, 7).await;

        let _guard = h.service.orchestrator().locks().try_acquire(lab_id).unwrap();
        assert!(matches!(
            h.service.delete_lab(&alice, lab_id),
            Err(Error::LabBusy(id)) if id == lab_id
        ));
        assert_eq!(
            h.service.get_lab(&alice, lab_id).unwrap().0.status,
            LabStatus::Running
        );
    }

    #[tokio::test]
    async fn test_update_vm() {
        let h = harness();
        let alice = Caller::user(1);
        let admin = Caller::admin(99);
        let lab_id = running_lab(&h, &alice, 7).await;
        let vms = h.service.get_lab(&alice, lab_id).unwrap().1;
        let first = vms[0].id;

        let rename = VmUpdate {
            name: Some("kali".into()),
            ..Default::default()
        };
        assert!(matches!(
            h.service.update_vm(&alice, lab_id, first, rename.clone()),
            Err(Error::PermissionDenied(_))
        ));

        // The unit name and data directory derive from the name.
        assert!(matches!(
            h.service.update_vm(&admin, lab_id, first, rename),
            Err(Error::InvalidState { .. })
        ));

        let configure = VmUpdate {
            vm_config: Some("profile=red".into()),
            ..Default::default()
        };
        let vm = h.service.update_vm(&admin, lab_id, first, configure).unwrap();
        assert_eq!(vm.vm_config.as_deref(), Some("profile=red"));
        assert_eq!(vm.name, vms[0].name);

        let terminate = VmUpdate {
            status: Some(LabStatus::Terminated),
            ..Default::default()
        };
        assert!(matches!(
            h.service.update_vm(&admin, lab_id, first, terminate),
            Err(Error::Validation(_))
        ));
        assert_eq!(
            h.service.get_lab(&admin, lab_id).unwrap().1[0].status,
            LabStatus::Running
        );

        let clash = VmUpdate {
            name: Some(vms[1].name.to_uppercase()),
            ..Default::default()
        };
        assert!(matches!(
            h.service.update_vm(&admin, lab_id, first, clash),
            Err(Error::Validation(_))
        ));

        assert!(matches!(
            h.service.update_vm(&admin, lab_id + 1, first, VmUpdate::default()),
            Err(Error::VmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_expired_requires_admin() {
        let h = harness();
        assert!(matches!(
            h.service.cleanup_expired(&Caller::user(1)).await,
            Err(Error::PermissionDenied(_))
        ));
        assert_eq!(h.service.cleanup_expired(&Caller::admin(99)).await.unwrap(), 0);
    }
}
