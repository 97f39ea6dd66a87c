//! Caller identity, as forwarded by the upstream authenticator.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::error::ApiError;
use crate::service::Caller;

/// Header carrying the user identity.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the user role; `admin` is privileged.
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Extracts the [`Caller`] from request headers.
#[derive(Debug, Clone, Copy)]
pub struct AuthCaller(pub Caller);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthCaller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ApiError::Unauthorized(format!("invalid {} header", USER_ID_HEADER)))?;

        let admin = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|role| role.trim().eq_ignore_ascii_case("admin"));

        Ok(AuthCaller(Caller { user_id, admin }))
    }
}
