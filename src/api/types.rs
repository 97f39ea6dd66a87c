//! API request and response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::lab::{Lab, LabId, VirtualMachine};

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorResponse {
    /// Error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
}

/// A lab with its VMs.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LabResponse {
    pub lab: Lab,
    pub vms: Vec<VirtualMachine>,
}

/// Query of `GET /api/v1/labs`.
#[derive(Debug, Default, Deserialize)]
pub struct ListLabsQuery {
    /// Include labs past their expiration.
    #[serde(default)]
    pub include_expired: bool,
}

/// Labs visible to the caller.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListLabsResponse {
    pub labs: Vec<Lab>,
}

/// Body of `POST /api/v1/labs/{id}/extend`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtendLabRequest {
    /// Hours to add to the expiration.
    pub hours: u32,
}

/// Response of an accepted delete.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteLabResponse {
    pub lab_id: LabId,
    pub message: String,
}

/// Response of a manual expiry sweep.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CleanupResponse {
    /// Labs reclaimed.
    pub count: usize,
}
