//! Error types for labvisor.

use std::time::Duration;
use thiserror::Error;

use crate::lab::{LabId, VmId};

/// Result type alias using the labvisor [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the lab orchestration core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input rejected before reaching the core.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Lab identity unknown.
    #[error("lab {0} not found")]
    LabNotFound(LabId),

    /// VM identity unknown (or not part of the addressed lab).
    #[error("vm {0} not found")]
    VmNotFound(VmId),

    /// Caller is neither the owner nor privileged.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Request conflicts with existing state (duplicate lab, quota, port).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another provision/teardown operation holds the lab.
    #[error("lab {0} has an operation in progress")]
    LabBusy(LabId),

    /// A guarded status update found an unexpected status.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// The status (or set of statuses) the operation required.
        expected: String,
        /// The status actually stored.
        actual: String,
    },

    /// Provisioning of a lab or VM failed.
    #[error("provisioning failed during {operation}: {message}")]
    Provisioning {
        /// The step that failed.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// The container runtime does not know the unit.
    #[error("runtime unit not found: {0}")]
    UnitNotFound(String),

    /// Container runtime failure other than NotFound.
    #[error("runtime error during {operation}: {message}")]
    Runtime {
        /// The runtime operation.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// VPN provisioner failure.
    #[error("vpn error during {operation}: {message}")]
    Vpn {
        /// The VPN operation.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// A capability call exceeded its time budget.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// The call that timed out.
        operation: String,
        /// The budget that elapsed.
        timeout: Duration,
    },

    /// State store failure.
    #[error("storage error during {operation}: {message}")]
    Storage {
        /// The store operation.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a runtime error.
    pub fn runtime(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Runtime {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a VPN error.
    pub fn vpn(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vpn {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a provisioning error.
    pub fn provisioning(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config(format!("{}: {}", operation.into(), message.into()))
    }

    /// Create an invalid-state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the error reports a missing runtime unit.
    pub fn is_unit_not_found(&self) -> bool {
        matches!(self, Self::UnitNotFound(_))
    }
}
