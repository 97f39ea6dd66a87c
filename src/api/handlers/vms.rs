//! VM handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::auth::AuthCaller;
use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::ApiErrorResponse;
use crate::lab::{LabId, VirtualMachine, VmId, VmUpdate};

/// Update VM fields. Admin only.
#[utoipa::path(
    put,
    path = "/api/v1/labs/{id}/vms/{vm_id}",
    tag = "VMs",
    params(
        ("id" = u64, Path, description = "Lab identity"),
        ("vm_id" = u64, Path, description = "VM identity")
    ),
    request_body = VmUpdate,
    responses(
        (status = 200, description = "VM updated", body = VirtualMachine),
        (status = 400, description = "Invalid update", body = ApiErrorResponse),
        (status = 403, description = "Not an administrator", body = ApiErrorResponse),
        (status = 404, description = "VM not found", body = ApiErrorResponse),
        (status = 409, description = "Status change not allowed, or the VM has a live unit", body = ApiErrorResponse)
    )
)]
pub async fn update_vm(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Path((lab_id, vm_id)): Path<(LabId, VmId)>,
    Json(update): Json<VmUpdate>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(
        state.service().update_vm(&caller, lab_id, vm_id, update)?,
    ))
}
