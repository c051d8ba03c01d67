use axum::{extract::FromRequestParts, http::request::Parts};

use super::error::ApiError;
use crate::constants::USER_ID_HEADER;
use crate::models::UserId;

/// The caller, as asserted by the upstream gateway in `x-user-id`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?;
        let user = raw
            .trim()
            .parse()
            .map_err(|_| ApiError::Unauthorized(format!("{} must be a UUID", USER_ID_HEADER)))?;
        Ok(AuthUser(user))
    }
}
