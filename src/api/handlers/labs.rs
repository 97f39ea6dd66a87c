//! Lab handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::auth::AuthCaller;
use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{
    ApiErrorResponse, CleanupResponse, DeleteLabResponse, ExtendLabRequest, LabResponse,
    ListLabsQuery, ListLabsResponse,
};
use crate::lab::{Lab, LabId};
use crate::service::{CreateLab, LabAccess, LabStatusView};

/// Create a lab and start provisioning it.
#[utoipa::path(
    post,
    path = "/api/v1/labs",
    tag = "Labs",
    request_body = CreateLab,
    responses(
        (status = 201, description = "Lab created, provisioning started", body = LabResponse),
        (status = 400, description = "Invalid request", body = ApiErrorResponse),
        (status = 401, description = "Missing caller identity", body = ApiErrorResponse),
        (status = 409, description = "Active lab exists or quota reached", body = ApiErrorResponse)
    )
)]
pub async fn create_lab(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Json(req): Json<CreateLab>,
) -> Result<(StatusCode, Json<LabResponse>), ApiError> {
    let (lab, vms, _provisioning) = state.service().create_lab(&caller, req)?;
    Ok((StatusCode::CREATED, Json(LabResponse { lab, vms })))
}

/// List labs visible to the caller.
#[utoipa::path(
    get,
    path = "/api/v1/labs",
    tag = "Labs",
    params(
        ("include_expired" = Option<bool>, Query, description = "Include expired labs")
    ),
    responses(
        (status = 200, description = "Labs", body = ListLabsResponse),
        (status = 401, description = "Missing caller identity", body = ApiErrorResponse)
    )
)]
pub async fn list_labs(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Query(query): Query<ListLabsQuery>,
) -> Result<Json<ListLabsResponse>, ApiError> {
    let labs = state.service().list_labs(&caller, query.include_expired)?;
    Ok(Json(ListLabsResponse { labs }))
}

/// Get a lab and its VMs.
#[utoipa::path(
    get,
    path = "/api/v1/labs/{id}",
    tag = "Labs",
    params(
        ("id" = u64, Path, description = "Lab identity")
    ),
    responses(
        (status = 200, description = "Lab", body = LabResponse),
        (status = 403, description = "Not the owner", body = ApiErrorResponse),
        (status = 404, description = "Lab not found", body = ApiErrorResponse)
    )
)]
pub async fn get_lab(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Path(id): Path<LabId>,
) -> Result<Json<LabResponse>, ApiError> {
    let (lab, vms) = state.service().get_lab(&caller, id)?;
    Ok(Json(LabResponse { lab, vms }))
}

/// Delete a lab.
///
/// Teardown runs in the background; the lab record is removed once every
/// resource is released.
#[utoipa::path(
    delete,
    path = "/api/v1/labs/{id}",
    tag = "Labs",
    params(
        ("id" = u64, Path, description = "Lab identity")
    ),
    responses(
        (status = 202, description = "Teardown started", body = DeleteLabResponse),
        (status = 403, description = "Not the owner", body = ApiErrorResponse),
        (status = 404, description = "Lab not found", body = ApiErrorResponse),
        (status = 409, description = "Operation in progress", body = ApiErrorResponse)
    )
)]
pub async fn delete_lab(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Path(id): Path<LabId>,
) -> Result<(StatusCode, Json<DeleteLabResponse>), ApiError> {
    let (lab, _teardown) = state.service().delete_lab(&caller, id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeleteLabResponse {
            lab_id: lab.id,
            message: "teardown started".into(),
        }),
    ))
}

/// Extend a lab's expiration.
#[utoipa::path(
    post,
    path = "/api/v1/labs/{id}/extend",
    tag = "Labs",
    params(
        ("id" = u64, Path, description = "Lab identity")
    ),
    request_body = ExtendLabRequest,
    responses(
        (status = 200, description = "Lab extended", body = Lab),
        (status = 400, description = "Invalid hours", body = ApiErrorResponse),
        (status = 404, description = "Lab not found", body = ApiErrorResponse),
        (status = 409, description = "Lab terminated or expired", body = ApiErrorResponse)
    )
)]
pub async fn extend_lab(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Path(id): Path<LabId>,
    Json(req): Json<ExtendLabRequest>,
) -> Result<Json<Lab>, ApiError> {
    Ok(Json(state.service().extend_lab(&caller, id, req.hours)?))
}

/// VPN configuration and per-VM access strings.
#[utoipa::path(
    get,
    path = "/api/v1/labs/{id}/access",
    tag = "Labs",
    params(
        ("id" = u64, Path, description = "Lab identity")
    ),
    responses(
        (status = 200, description = "Access details", body = LabAccess),
        (status = 404, description = "Lab not found", body = ApiErrorResponse),
        (status = 409, description = "VPN endpoint not ready", body = ApiErrorResponse)
    )
)]
pub async fn lab_access(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Path(id): Path<LabId>,
) -> Result<Json<LabAccess>, ApiError> {
    Ok(Json(state.service().lab_access(&caller, id)?))
}

/// Lab status and remaining time.
#[utoipa::path(
    get,
    path = "/api/v1/labs/{id}/status",
    tag = "Labs",
    params(
        ("id" = u64, Path, description = "Lab identity")
    ),
    responses(
        (status = 200, description = "Lab status", body = LabStatusView),
        (status = 404, description = "Lab not found", body = ApiErrorResponse)
    )
)]
pub async fn lab_status(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
    Path(id): Path<LabId>,
) -> Result<Json<LabStatusView>, ApiError> {
    Ok(Json(state.service().lab_status(&caller, id)?))
}

/// Reclaim every expired lab now. Admin only.
#[utoipa::path(
    post,
    path = "/api/v1/labs/cleanup",
    tag = "Labs",
    responses(
        (status = 200, description = "Labs reclaimed", body = CleanupResponse),
        (status = 403, description = "Not an administrator", body = ApiErrorResponse)
    )
)]
pub async fn cleanup_expired(
    State(state): State<Arc<ApiState>>,
    AuthCaller(caller): AuthCaller,
) -> Result<Json<CleanupResponse>, ApiError> {
    let count = state.service().cleanup_expired(&caller).await?;
    Ok(Json(CleanupResponse { count }))
}
