//! Durable lab state store.
//!
//! [`LabStore`] keeps labs and VMs in an embedded redb database. Records are
//! JSON-encoded values keyed by identity; a multimap indexes VMs by lab.
//!
//! Every mutation runs inside a single write transaction. redb serializes
//! write transactions, so a status update that checks the stored status and
//! writes the new one is a true compare-and-set: a stale in-memory copy held
//! by a caller can never overwrite a transition made concurrently.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
    WriteTransaction,
};
use std::path::Path;

use crate::error::{Error, Result};
use crate::lab::{
    Lab, LabId, LabStatus, NewLab, UserId, VirtualMachine, VmId, VmSpec, VmUpdate,
};

const LABS: TableDefinition<u64, &[u8]> = TableDefinition::new("labs");
const VMS: TableDefinition<u64, &[u8]> = TableDefinition::new("vms");
const LAB_VMS: MultimapTableDefinition<u64, u64> = MultimapTableDefinition::new("lab_vms");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_LAB_ID: &str = "next_lab_id";
const NEXT_VM_ID: &str = "next_vm_id";

/// Map any redb error into a storage error tagged with the operation.
trait StoreResultExt<T> {
    fn store_op(self, operation: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> StoreResultExt<T> for std::result::Result<T, E> {
    fn store_op(self, operation: &str) -> Result<T> {
        self.map_err(|e| Error::storage(operation, e.to_string()))
    }
}

/// Limits enforced atomically when a lab is created.
#[derive(Debug, Clone, Copy)]
pub struct LabLimits {
    /// Maximum non-terminated labs per owner.
    pub max_labs_per_user: usize,
    /// Maximum VMs per lab.
    pub max_vms_per_lab: usize,
}

/// Durable record of labs and VMs.
pub struct LabStore {
    db: Database,
}

impl LabStore {
    /// Open or create a store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::storage("create directory", e.to_string()))?;
        }
        let db = Database::create(path).store_op("open database")?;
        Self::init(db)
    }

    /// Create a store that lives only in memory.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .store_op("open in-memory database")?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let txn = db.begin_write().store_op("begin init")?;
        {
            txn.open_table(LABS).store_op("open labs")?;
            txn.open_table(VMS).store_op("open vms")?;
            txn.open_multimap_table(LAB_VMS).store_op("open lab_vms")?;
            txn.open_table(META).store_op("open meta")?;
        }
        txn.commit().store_op("commit init")?;
        Ok(Self { db })
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<T>(&self, operation: &str, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_write().store_op(operation)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().store_op(operation)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::debug!(operation, error = %abort_err, "abort after failed write");
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a lab (status CREATING) and its VM set in one transaction.
    ///
    /// Rejects when the owner already has a non-terminated lab for the same
    /// challenge, or has reached the per-user lab limit.
    pub fn create_lab(
        &self,
        new: NewLab,
        specs: Vec<VmSpec>,
        limits: LabLimits,
        now: DateTime<Utc>,
    ) -> Result<(Lab, Vec<VirtualMachine>)> {
        if new.expires_at <= now {
            return Err(Error::Validation(
                "expires_at must be later than the creation time".into(),
            ));
        }
        if specs.is_empty() {
            return Err(Error::Validation("a lab needs at least one VM".into()));
        }
        if specs.len() > limits.max_vms_per_lab {
            return Err(Error::Validation(format!(
                "too many VMs: {} (max {})",
                specs.len(),
                limits.max_vms_per_lab
            )));
        }

        self.write("create lab", |txn| {
            let mut labs = txn.open_table(LABS).store_op("open labs")?;

            let mut owner_active = 0usize;
            for entry in labs.iter().store_op("scan labs")? {
                let (_, value) = entry.store_op("scan labs")?;
                let lab: Lab = serde_json::from_slice(value.value())?;
                if lab.owner != new.owner || !lab.status.is_active() {
                    continue;
                }
                if lab.challenge_id == new.challenge_id {
                    return Err(Error::Conflict(format!(
                        "user {} already has active lab {} for challenge {}",
                        new.owner, lab.id, new.challenge_id
                    )));
                }
                owner_active += 1;
            }
            if owner_active >= limits.max_labs_per_user {
                return Err(Error::Conflict(format!(
                    "user {} already has {} active labs (max {})",
                    new.owner, owner_active, limits.max_labs_per_user
                )));
            }

            let mut meta = txn.open_table(META).store_op("open meta")?;
            let lab_id = next_id(&mut meta, NEXT_LAB_ID)?;

            let lab = Lab {
                id: lab_id,
                name: new.name,
                description: new.description,
                owner: new.owner,
                challenge_id: new.challenge_id,
                status: LabStatus::Creating,
                vpn_config: None,
                vpn_port: None,
                internal_ip: None,
                created_at: now,
                expires_at: new.expires_at,
                last_accessed: None,
            };
            labs.insert(lab_id, serde_json::to_vec(&lab)?.as_slice())
                .store_op("insert lab")?;

            let mut vms_table = txn.open_table(VMS).store_op("open vms")?;
            let mut index = txn.open_multimap_table(LAB_VMS).store_op("open lab_vms")?;
            let mut vms = Vec::with_capacity(specs.len());
            for spec in specs {
                let vm_id = next_id(&mut meta, NEXT_VM_ID)?;
                let vm = VirtualMachine {
                    id: vm_id,
                    lab_id,
                    name: spec.name,
                    vm_type: spec.vm_type,
                    status: LabStatus::Creating,
                    internal_ip: None,
                    ssh_port: spec.ssh_port,
                    rdp_port: spec.rdp_port,
                    custom_ports: spec.custom_ports,
                    unit_id: None,
                    vm_config: spec.vm_config,
                    diagnostic: None,
                    created_at: now,
                };
                vms_table
                    .insert(vm_id, serde_json::to_vec(&vm)?.as_slice())
                    .store_op("insert vm")?;
                index.insert(lab_id, vm_id).store_op("index vm")?;
                vms.push(vm);
            }

            Ok((lab, vms))
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a lab by identity.
    pub fn get_lab(&self, id: LabId) -> Result<Lab> {
        let txn = self.db.begin_read().store_op("begin read")?;
        let labs = txn.open_table(LABS).store_op("open labs")?;
        let guard = labs.get(id).store_op("get lab")?;
        match guard {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Err(Error::LabNotFound(id)),
        }
    }

    /// Get a VM by identity.
    pub fn get_vm(&self, id: VmId) -> Result<VirtualMachine> {
        let txn = self.db.begin_read().store_op("begin read")?;
        let vms = txn.open_table(VMS).store_op("open vms")?;
        let guard = vms.get(id).store_op("get vm")?;
        match guard {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Err(Error::VmNotFound(id)),
        }
    }

    /// VMs of a lab, ordered by identity.
    pub fn lab_vms(&self, lab_id: LabId) -> Result<Vec<VirtualMachine>> {
        let txn = self.db.begin_read().store_op("begin read")?;
        let index = txn.open_multimap_table(LAB_VMS).store_op("open lab_vms")?;
        let vms = txn.open_table(VMS).store_op("open vms")?;

        let mut out = Vec::new();
        for vm_id in index.get(lab_id).store_op("read lab_vms")? {
            let vm_id = vm_id.store_op("read lab_vms")?.value();
            if let Some(value) = vms.get(vm_id).store_op("get vm")? {
                out.push(serde_json::from_slice::<VirtualMachine>(value.value())?);
            }
        }
        out.sort_by_key(|vm| vm.id);
        Ok(out)
    }

    /// All labs, ordered by identity.
    pub fn list_labs(&self) -> Result<Vec<Lab>> {
        self.scan_labs(|_| true)
    }

    /// Labs owned by `owner`; expired ones only when requested.
    pub fn labs_for_user(
        &self,
        owner: UserId,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lab>> {
        self.scan_labs(|lab| lab.owner == owner && (include_expired || !lab.is_expired(now)))
    }

    /// Labs past expiration that are not yet terminated.
    pub fn expired_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>> {
        self.scan_labs(|lab| lab.is_expired(now) && lab.status != LabStatus::Terminated)
    }

    /// Labs that are up (RUNNING or WARNING) and may be evicted.
    pub fn evictable_labs(&self) -> Result<Vec<Lab>> {
        self.scan_labs(|lab| lab.status.is_running())
    }

    /// Non-terminated labs with their VMs.
    pub fn active_labs_with_vms(&self) -> Result<Vec<(Lab, Vec<VirtualMachine>)>> {
        let labs = self.scan_labs(|lab| lab.status.is_active())?;
        let mut out = Vec::with_capacity(labs.len());
        for lab in labs {
            let vms = self.lab_vms(lab.id)?;
            out.push((lab, vms));
        }
        Ok(out)
    }

    /// Find the VM whose record names `unit_id` as its runtime unit.
    pub fn find_vm_by_unit(&self, unit_id: &str) -> Result<Option<VirtualMachine>> {
        let txn = self.db.begin_read().store_op("begin read")?;
        let vms = txn.open_table(VMS).store_op("open vms")?;
        for entry in vms.iter().store_op("scan vms")? {
            let (_, value) = entry.store_op("scan vms")?;
            let vm: VirtualMachine = serde_json::from_slice(value.value())?;
            if vm.unit_id.as_deref() == Some(unit_id) {
                return Ok(Some(vm));
            }
        }
        Ok(None)
    }

    fn scan_labs(&self, keep: impl Fn(&Lab) -> bool) -> Result<Vec<Lab>> {
        let txn = self.db.begin_read().store_op("begin read")?;
        let labs = txn.open_table(LABS).store_op("open labs")?;
        let mut out = Vec::new();
        for entry in labs.iter().store_op("scan labs")? {
            let (_, value) = entry.store_op("scan labs")?;
            let lab: Lab = serde_json::from_slice(value.value())?;
            if keep(&lab) {
                out.push(lab);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Guarded updates
    // ========================================================================

    /// Move a lab to `next` if its stored status is one of `expected`.
    pub fn transition_lab(&self, id: LabId, expected: &[LabStatus], next: LabStatus) -> Result<Lab> {
        self.update_lab_with("transition lab", id, |lab| {
            check_expected(lab.status, expected)?;
            if !lab.status.lab_transition_allowed(next) {
                return Err(Error::invalid_state(
                    format!("a status that may become {}", next),
                    lab.status.to_string(),
                ));
            }
            lab.status = next;
            Ok(())
        })
    }

    /// Record the VPN endpoint of a lab that is PROVISIONING.
    pub fn set_lab_network(
        &self,
        id: LabId,
        vpn_config: String,
        vpn_port: u16,
        internal_ip: String,
    ) -> Result<Lab> {
        self.update_lab_with("set lab network", id, |lab| {
            check_expected(lab.status, &[LabStatus::Provisioning])?;
            lab.vpn_config = Some(vpn_config);
            lab.vpn_port = Some(vpn_port);
            lab.internal_ip = Some(internal_ip);
            Ok(())
        })
    }

    /// Push the expiration of an unexpired, non-terminated lab by `hours`.
    pub fn extend_lab(&self, id: LabId, hours: u32, now: DateTime<Utc>) -> Result<Lab> {
        self.update_lab_with("extend lab", id, |lab| {
            if matches!(
                lab.status,
                LabStatus::Terminating | LabStatus::Terminated | LabStatus::Error
            ) {
                return Err(Error::invalid_state("an active lab", lab.status.to_string()));
            }
            if lab.is_expired(now) {
                return Err(Error::invalid_state("an unexpired lab", "expired"));
            }
            lab.expires_at += ChronoDuration::hours(i64::from(hours));
            Ok(())
        })
    }

    /// Stamp the last access time of a lab.
    pub fn touch_lab(&self, id: LabId, now: DateTime<Utc>) -> Result<Lab> {
        self.update_lab_with("touch lab", id, |lab| {
            lab.last_accessed = Some(now);
            Ok(())
        })
    }

    fn update_lab_with(
        &self,
        operation: &str,
        id: LabId,
        f: impl FnOnce(&mut Lab) -> Result<()>,
    ) -> Result<Lab> {
        self.write(operation, |txn| {
            let mut labs = txn.open_table(LABS).store_op("open labs")?;
            let mut lab: Lab = match labs.get(id).store_op("get lab")? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(Error::LabNotFound(id)),
            };
            f(&mut lab)?;
            labs.insert(id, serde_json::to_vec(&lab)?.as_slice())
                .store_op("update lab")?;
            Ok(lab)
        })
    }

    /// Move a VM to `next` if its stored status is one of `expected`,
    /// applying `patch` in the same transaction.
    pub fn transition_vm(
        &self,
        id: VmId,
        expected: &[LabStatus],
        next: LabStatus,
        patch: impl FnOnce(&mut VirtualMachine),
    ) -> Result<VirtualMachine> {
        self.update_vm_with("transition vm", id, |vm| {
            check_expected(vm.status, expected)?;
            if !vm.status.vm_transition_allowed(next) {
                return Err(Error::invalid_state(
                    format!("a status that may become {}", next),
                    vm.status.to_string(),
                ));
            }
            vm.status = next;
            patch(vm);
            Ok(())
        })
    }

    /// Record the runtime unit backing a PROVISIONING VM, together with the
    /// address it was given and the SSH port it was assigned.
    pub fn record_vm_unit(
        &self,
        id: VmId,
        unit_id: String,
        internal_ip: Option<String>,
        ssh_port: u16,
    ) -> Result<VirtualMachine> {
        self.update_vm_with("record vm unit", id, |vm| {
            check_expected(vm.status, &[LabStatus::Provisioning])?;
            vm.unit_id = Some(unit_id);
            vm.internal_ip = internal_ip;
            vm.ssh_port = Some(ssh_port);
            Ok(())
        })
    }

    /// Apply field updates to a VM of `lab_id`.
    ///
    /// The name and host ports of a VM backed by a live unit are fixed: the
    /// unit name, data directory and port leases derive from them.
    pub fn update_vm(&self, lab_id: LabId, vm_id: VmId, update: VmUpdate) -> Result<VirtualMachine> {
        self.update_vm_with("update vm", vm_id, |vm| {
            if vm.lab_id != lab_id {
                return Err(Error::VmNotFound(vm_id));
            }
            let rebinds = update.name.is_some()
                || update.ssh_port.is_some()
                || update.rdp_port.is_some()
                || update.custom_ports.is_some();
            if rebinds && vm.unit_id.is_some() && vm.status != LabStatus::Terminated {
                return Err(Error::invalid_state(
                    "a vm without a live unit",
                    format!("{} with unit", vm.status),
                ));
            }
            if matches!(
                update.status,
                Some(LabStatus::Provisioning | LabStatus::Terminated)
            ) && update.status != Some(vm.status)
            {
                return Err(Error::invalid_state(
                    "a target other than provisioning or terminated",
                    vm.status.to_string(),
                ));
            }
            if let Some(status) = update.status {
                if status != vm.status && !vm.status.vm_transition_allowed(status) {
                    return Err(Error::invalid_state(
                        format!("a status that may become {}", status),
                        vm.status.to_string(),
                    ));
                }
                vm.status = status;
            }
            if let Some(name) = update.name {
                vm.name = name;
            }
            if let Some(port) = update.ssh_port {
                vm.ssh_port = Some(port);
            }
            if let Some(port) = update.rdp_port {
                vm.rdp_port = Some(port);
            }
            if let Some(ports) = update.custom_ports {
                vm.custom_ports = ports;
            }
            if let Some(config) = update.vm_config {
                vm.vm_config = Some(config);
            }
            Ok(())
        })
    }

    fn update_vm_with(
        &self,
        operation: &str,
        id: VmId,
        f: impl FnOnce(&mut VirtualMachine) -> Result<()>,
    ) -> Result<VirtualMachine> {
        self.write(operation, |txn| {
            let mut vms = txn.open_table(VMS).store_op("open vms")?;
            let mut vm: VirtualMachine = match vms.get(id).store_op("get vm")? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(Error::VmNotFound(id)),
            };
            f(&mut vm)?;
            vms.insert(id, serde_json::to_vec(&vm)?.as_slice())
                .store_op("update vm")?;
            Ok(vm)
        })
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove a TERMINATED lab, deleting its VM records first.
    pub fn remove_lab(&self, id: LabId) -> Result<()> {
        self.write("remove lab", |txn| {
            let mut labs = txn.open_table(LABS).store_op("open labs")?;
            let lab: Lab = match labs.get(id).store_op("get lab")? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(Error::LabNotFound(id)),
            };
            check_expected(lab.status, &[LabStatus::Terminated])?;

            let mut index = txn.open_multimap_table(LAB_VMS).store_op("open lab_vms")?;
            let mut vms = txn.open_table(VMS).store_op("open vms")?;
            let mut vm_ids = Vec::new();
            for vm_id in index.remove_all(id).store_op("remove lab_vms")? {
                vm_ids.push(vm_id.store_op("remove lab_vms")?.value());
            }
            for vm_id in vm_ids {
                vms.remove(vm_id).store_op("remove vm")?;
            }
            labs.remove(id).store_op("remove lab")?;
            Ok(())
        })
    }
}

fn next_id(meta: &mut redb::Table<'_, &'static str, u64>, key: &str) -> Result<u64> {
    let current = meta
        .get(key)
        .store_op("read counter")?
        .map(|v| v.value())
        .unwrap_or(1);
    meta.insert(key, current + 1).store_op("bump counter")?;
    Ok(current)
}

fn check_expected(actual: LabStatus, expected: &[LabStatus]) -> Result<()> {
    if expected.contains(&actual) {
        return Ok(());
    }
    let expected = expected
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("|");
    Err(Error::invalid_state(expected, actual.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::VmType;

    const LIMITS: LabLimits = LabLimits {
        max_labs_per_user: 3,
        max_vms_per_lab: 5,
    };

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            vm_type: VmType::Ubuntu,
            ssh_port: None,
            rdp_port: None,
            custom_ports: Default::default(),
            vm_config: None,
        }
    }

    fn new_lab(owner: UserId, challenge: u64, now: DateTime<Utc>) -> NewLab {
        NewLab {
            name: format!("lab-{}-{}", owner, challenge),
            description: None,
            owner,
            challenge_id: challenge,
            expires_at: now + ChronoDuration::hours(1),
        }
    }

    #[test]
    fn test_create_lab_with_vms() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, vms) = store
            .create_lab(new_lab(1, 10, now), vec![spec("a"), spec("b")], LIMITS, now)
            .unwrap();

        assert_eq!(lab.status, LabStatus::Creating);
        assert!(lab.expires_at > lab.created_at);
        assert_eq!(vms.len(), 2);
        assert!(vms.iter().all(|vm| vm.status == LabStatus::Creating));
        assert!(vms.iter().all(|vm| vm.unit_id.is_none()));
        assert_eq!(store.lab_vms(lab.id).unwrap(), vms);
        assert_eq!(store.get_lab(lab.id).unwrap(), lab);
    }

    #[test]
    fn test_duplicate_active_lab_rejected() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, _) = store
            .create_lab(new_lab(1, 10, now), vec![spec("a")], LIMITS, now)
            .unwrap();

        let err = store
            .create_lab(new_lab(1, 10, now), vec![spec("a")], LIMITS, now)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.list_labs().unwrap().len(), 1);

        // A different user may take the same challenge.
        store
            .create_lab(new_lab(2, 10, now), vec![spec("a")], LIMITS, now)
            .unwrap();

        // Once terminated, the pair is free again.
        for status in [
            LabStatus::Terminating,
            LabStatus::Terminated,
        ] {
            let current = store.get_lab(lab.id).unwrap().status;
            store.transition_lab(lab.id, &[current], status).unwrap();
        }
        store
            .create_lab(new_lab(1, 10, now), vec![spec("a")], LIMITS, now)
            .unwrap();
    }

    #[test]
    fn test_per_user_limit() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        for challenge in 0..3 {
            store
                .create_lab(new_lab(7, challenge, now), vec![spec("a")], LIMITS, now)
                .unwrap();
        }
        let err = store
            .create_lab(new_lab(7, 99, now), vec![spec("a")], LIMITS, now)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_create_validation() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut past = new_lab(1, 1, now);
        past.expires_at = now;
        assert!(matches!(
            store.create_lab(past, vec![spec("a")], LIMITS, now),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.create_lab(new_lab(1, 1, now), vec![], LIMITS, now),
            Err(Error::Validation(_))
        ));
        let too_many = (0..6).map(|i| spec(&format!("vm{}", i))).collect();
        assert!(matches!(
            store.create_lab(new_lab(1, 1, now), too_many, LIMITS, now),
            Err(Error::Validation(_))
        ));
        assert!(store.list_labs().unwrap().is_empty());
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, _) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();

        store
            .transition_lab(lab.id, &[LabStatus::Creating], LabStatus::Provisioning)
            .unwrap();

        // A second writer holding the stale CREATING view loses.
        let err = store
            .transition_lab(lab.id, &[LabStatus::Creating], LabStatus::Provisioning)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        // Forbidden edges are rejected even when the precondition matches.
        let err = store
            .transition_lab(lab.id, &[LabStatus::Provisioning], LabStatus::Creating)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(store.get_lab(lab.id).unwrap().status, LabStatus::Provisioning);

        assert!(matches!(
            store.transition_lab(999, &[LabStatus::Creating], LabStatus::Provisioning),
            Err(Error::LabNotFound(999))
        ));
    }

    #[test]
    fn test_transition_vm_applies_patch() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (_, vms) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();
        let vm_id = vms[0].id;

        store
            .transition_vm(vm_id, &[LabStatus::Creating], LabStatus::Provisioning, |_| {})
            .unwrap();
        let vm = store
            .transition_vm(vm_id, &[LabStatus::Provisioning], LabStatus::Running, |vm| {
                vm.unit_id = Some("unit-1".into());
                vm.internal_ip = Some("172.16.0.5".into());
            })
            .unwrap();
        assert_eq!(vm.unit_id.as_deref(), Some("unit-1"));
        assert_eq!(store.find_vm_by_unit("unit-1").unwrap().unwrap().id, vm_id);

        // Unit details are only recorded while provisioning.
        assert!(matches!(
            store.record_vm_unit(vm_id, "unit-9".into(), None, 2222),
            Err(Error::InvalidState { .. })
        ));
        assert!(store.find_vm_by_unit("unit-2").unwrap().is_none());

        // Patch is not applied when the precondition fails.
        let err = store
            .transition_vm(vm_id, &[LabStatus::Creating], LabStatus::Error, |vm| {
                vm.unit_id = None;
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(store.get_vm(vm_id).unwrap().unit_id.as_deref(), Some("unit-1"));
    }

    #[test]
    fn test_extend_lab() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, _) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();

        let extended = store.extend_lab(lab.id, 2, now).unwrap();
        assert_eq!(extended.expires_at, lab.expires_at + ChronoDuration::hours(2));

        // Already expired: no mutation.
        let later = extended.expires_at + ChronoDuration::seconds(1);
        assert!(store.extend_lab(lab.id, 1, later).is_err());
        assert_eq!(store.get_lab(lab.id).unwrap().expires_at, extended.expires_at);

        // Terminated: no mutation.
        store
            .transition_lab(lab.id, &[LabStatus::Creating], LabStatus::Terminating)
            .unwrap();
        store
            .transition_lab(lab.id, &[LabStatus::Terminating], LabStatus::Terminated)
            .unwrap();
        assert!(store.extend_lab(lab.id, 1, now).is_err());
        assert_eq!(store.get_lab(lab.id).unwrap().expires_at, extended.expires_at);
    }

    #[test]
    fn test_update_vm_checks_ownership_and_status() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, vms) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();
        let vm_id = vms[0].id;

        let update = VmUpdate {
            ssh_port: Some(2222),
            vm_config: Some("{\"user\":\"student\"}".into()),
            ..Default::default()
        };
        let vm = store.update_vm(lab.id, vm_id, update).unwrap();
        assert_eq!(vm.ssh_port, Some(2222));
        assert_eq!(vm.vm_config.as_deref(), Some("{\"user\":\"student\"}"));

        assert!(matches!(
            store.update_vm(lab.id + 1, vm_id, VmUpdate::default()),
            Err(Error::VmNotFound(_))
        ));
        let bad = VmUpdate {
            status: Some(LabStatus::Warning),
            ..Default::default()
        };
        assert!(matches!(
            store.update_vm(lab.id, vm_id, bad),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_update_vm_keeps_unit_bindings() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, vms) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();
        let vm_id = vms[0].id;
        store
            .transition_vm(vm_id, &[LabStatus::Creating], LabStatus::Provisioning, |_| {})
            .unwrap();
        store
            .record_vm_unit(vm_id, "unit-1".into(), Some("172.16.1.2".into()), 20000)
            .unwrap();
        store
            .transition_vm(vm_id, &[LabStatus::Provisioning], LabStatus::Running, |_| {})
            .unwrap();

        let rebinding = [
            VmUpdate {
                name: Some("renamed".into()),
                ..Default::default()
            },
            VmUpdate {
                ssh_port: Some(2222),
                ..Default::default()
            },
            VmUpdate {
                rdp_port: Some(3390),
                ..Default::default()
            },
            VmUpdate {
                custom_ports: Some([("http".to_string(), 8080)].into_iter().collect()),
                ..Default::default()
            },
            VmUpdate {
                status: Some(LabStatus::Terminated),
                ..Default::default()
            },
        ];
        for update in rebinding {
            let desc = format!("{:?}", update);
            assert!(
                matches!(
                    store.update_vm(lab.id, vm_id, update),
                    Err(Error::InvalidState { .. })
                ),
                "{} accepted",
                desc
            );
        }
        let vm = store.get_vm(vm_id).unwrap();
        assert_eq!(vm.name, "a");
        assert_eq!(vm.ssh_port, Some(20000));
        assert_eq!(vm.status, LabStatus::Running);

        let vm = store
            .update_vm(
                lab.id,
                vm_id,
                VmUpdate {
                    vm_config: Some("profile=red".into()),
                    status: Some(LabStatus::Warning),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(vm.vm_config.as_deref(), Some("profile=red"));
        assert_eq!(vm.status, LabStatus::Warning);
        assert_eq!(vm.unit_id.as_deref(), Some("unit-1"));
    }

    #[test]
    fn test_remove_lab_requires_terminated() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (lab, vms) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a"), spec("b")], LIMITS, now)
            .unwrap();

        assert!(matches!(
            store.remove_lab(lab.id),
            Err(Error::InvalidState { .. })
        ));

        store
            .transition_lab(lab.id, &[LabStatus::Creating], LabStatus::Terminating)
            .unwrap();
        store
            .transition_lab(lab.id, &[LabStatus::Terminating], LabStatus::Terminated)
            .unwrap();
        store.remove_lab(lab.id).unwrap();

        assert!(matches!(store.get_lab(lab.id), Err(Error::LabNotFound(_))));
        for vm in vms {
            assert!(matches!(store.get_vm(vm.id), Err(Error::VmNotFound(_))));
        }
        assert!(store.lab_vms(lab.id).unwrap().is_empty());
    }

    #[test]
    fn test_expired_and_user_queries() {
        let store = LabStore::open_in_memory().unwrap();
        let now = Utc::now();
        let (a, _) = store
            .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();
        let (b, _) = store
            .create_lab(new_lab(1, 2, now), vec![spec("a")], LIMITS, now)
            .unwrap();
        store.extend_lab(b.id, 5, now).unwrap();

        let later = now + ChronoDuration::hours(2);
        let expired: Vec<_> = store.expired_labs(later).unwrap().iter().map(|l| l.id).collect();
        assert_eq!(expired, vec![a.id]);

        assert_eq!(store.labs_for_user(1, false, later).unwrap().len(), 1);
        assert_eq!(store.labs_for_user(1, true, later).unwrap().len(), 2);
        assert!(store.labs_for_user(2, true, later).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("labs.redb");
        let now = Utc::now();

        let lab_id = {
            let store = LabStore::open(&path).unwrap();
            let (lab, _) = store
                .create_lab(new_lab(1, 1, now), vec![spec("a")], LIMITS, now)
                .unwrap();
            store
                .transition_lab(lab.id, &[LabStatus::Creating], LabStatus::Provisioning)
                .unwrap();
            lab.id
        };

        let store = LabStore::open(&path).unwrap();
        assert_eq!(store.get_lab(lab_id).unwrap().status, LabStatus::Provisioning);
        assert_eq!(store.lab_vms(lab_id).unwrap().len(), 1);

        // Identity counters survive reopening.
        let (next, _) = store
            .create_lab(new_lab(2, 1, now), vec![spec("a")], LIMITS, now)
            .unwrap();
        assert!(next.id > lab_id);
    }
}
