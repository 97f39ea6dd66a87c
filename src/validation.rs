//! Request validation, applied before anything reaches the store.

use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::lab::{LabStatus, VmSpec, VmUpdate};

/// Maximum VM name length.
pub const MAX_VM_NAME_LEN: usize = 40;

/// Maximum custom port name length.
pub const MAX_PORT_NAME_LEN: usize = 32;

/// Maximum lab display name length.
pub const MAX_LAB_NAME_LEN: usize = 100;

/// Validate a resource name.
///
/// Rules:
/// - Length: 1..=max_len characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_)
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
/// - No consecutive hyphens
/// - No path separators (/, \)
pub fn validate_resource_name(name: &str, kind: &str, max_len: usize) -> Result<()> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| Error::Validation(format!("{} name cannot be empty", kind)))?;

    if name.len() > max_len {
        return Err(Error::Validation(format!(
            "{} name too long: {} characters (max {})",
            kind,
            name.len(),
            max_len
        )));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err(Error::Validation(format!(
            "{} name must start with a letter or digit",
            kind
        )));
    }

    if name.ends_with('-') {
        return Err(Error::Validation(format!(
            "{} name cannot end with a hyphen",
            kind
        )));
    }

    let mut prev_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if prev_was_hyphen {
                return Err(Error::Validation(format!(
                    "{} name cannot contain consecutive hyphens",
                    kind
                )));
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }

        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            if c == '/' || c == '\\' {
                return Err(Error::Validation(format!(
                    "{} name cannot contain path separators",
                    kind
                )));
            }
            return Err(Error::Validation(format!(
                "{} name contains invalid character: '{}'",
                kind, c
            )));
        }
    }

    Ok(())
}

/// Validate a free-form display name.
pub fn validate_display_name(name: &str, kind: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation(format!("{} name cannot be empty", kind)));
    }
    if name.chars().count() > MAX_LAB_NAME_LEN {
        return Err(Error::Validation(format!(
            "{} name too long (max {} characters)",
            kind, MAX_LAB_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(Error::Validation(format!(
            "{} name cannot contain control characters",
            kind
        )));
    }
    Ok(())
}

/// Validate a host port.
pub fn validate_port(port: u16, what: &str) -> Result<()> {
    if port == 0 {
        return Err(Error::Validation(format!("{} port must be 1-65535", what)));
    }
    Ok(())
}

/// Validate the host ports one VM asks for: each valid, none repeated.
fn validate_vm_ports(
    vm: &str,
    ssh: Option<u16>,
    rdp: Option<u16>,
    custom: &BTreeMap<String, u16>,
) -> Result<()> {
    let mut seen = HashSet::new();
    let named = ssh
        .map(|p| ("ssh".to_string(), p))
        .into_iter()
        .chain(rdp.map(|p| ("rdp".to_string(), p)))
        .chain(custom.iter().map(|(name, p)| (name.clone(), *p)));

    for (name, port) in named {
        validate_port(port, &format!("vm '{}' {}", vm, name))?;
        if !seen.insert(port) {
            return Err(Error::Validation(format!(
                "vm '{}' requests port {} more than once",
                vm, port
            )));
        }
    }
    for name in custom.keys() {
        validate_resource_name(name, "port", MAX_PORT_NAME_LEN)?;
    }
    Ok(())
}

/// Validate the VM set of a new lab.
///
/// VM names must be unique within the lab, ignoring case, since they end up
/// in runtime unit names.
pub fn validate_vm_specs(specs: &[VmSpec], max_vms: usize) -> Result<()> {
    if specs.is_empty() {
        return Err(Error::Validation("a lab needs at least one VM".into()));
    }
    if specs.len() > max_vms {
        return Err(Error::Validation(format!(
            "too many VMs: {} (max {})",
            specs.len(),
            max_vms
        )));
    }

    let mut names = HashSet::new();
    for spec in specs {
        validate_resource_name(&spec.name, "vm", MAX_VM_NAME_LEN)?;
        if !names.insert(spec.name.to_ascii_lowercase()) {
            return Err(Error::Validation(format!(
                "duplicate vm name '{}'",
                spec.name
            )));
        }
        validate_vm_ports(&spec.name, spec.ssh_port, spec.rdp_port, &spec.custom_ports)?;
    }
    Ok(())
}

/// Validate the fields of a VM update that can be checked without the store.
///
/// PROVISIONING and TERMINATED are reached only through the orchestrator,
/// which owns the runtime unit behind the VM.
pub fn validate_vm_update(update: &VmUpdate) -> Result<()> {
    if let Some(status @ (LabStatus::Provisioning | LabStatus::Terminated)) = update.status {
        return Err(Error::Validation(format!(
            "vm status {} cannot be set directly",
            status
        )));
    }
    if let Some(name) = &update.name {
        validate_resource_name(name, "vm", MAX_VM_NAME_LEN)?;
    }
    let empty = BTreeMap::new();
    let custom = update.custom_ports.as_ref().unwrap_or(&empty);
    validate_vm_ports(
        update.name.as_deref().unwrap_or("update"),
        update.ssh_port,
        update.rdp_port,
        custom,
    )
}

/// Validate an extension request.
pub fn validate_extend_hours(hours: u32, max_hours: u32) -> Result<()> {
    if hours == 0 || hours > max_hours {
        return Err(Error::Validation(format!(
            "hours must be between 1 and {}",
            max_hours
        )));
    }
    Ok(())
}
