//! API error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::types::ApiErrorResponse;
use crate::Error;

/// Error returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// 400: malformed request.
    BadRequest(String),
    /// 401: no caller identity.
    Unauthorized(String),
    /// 403: caller may not act on the resource.
    Forbidden(String),
    /// 404: unknown lab or VM.
    NotFound(String),
    /// 409: conflicts with current state.
    Conflict(String),
    /// 500: anything else.
    Internal(String),
}

impl ApiError {
    /// HTTP status of this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), "request failed");
        }
        let body = ApiErrorResponse {
            error: self.message().to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let message = e.to_string();
        match e {
            Error::Validation(_) => ApiError::BadRequest(message),
            Error::LabNotFound(_) | Error::VmNotFound(_) => ApiError::NotFound(message),
            Error::PermissionDenied(_) => ApiError::Forbidden(message),
            Error::Conflict(_) | Error::LabBusy(_) | Error::InvalidState { .. } => {
                ApiError::Conflict(message)
            }
            _ => ApiError::Internal(message),
        }
    }
}
