//! Caller identity.
//!
//! Authentication happens upstream; the proxy in front of us forwards the
//! authenticated user in `X-User-Id` and their role in `X-User-Role`.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::warn;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const USER_NAME_HEADER: &str = "x-user-name";

#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: String,
    pub username: Option<String>,
    pub role: Option<String>,
}

impl CallerIdentity {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref().is_some_and(|r| r.eq_ignore_ascii_case("admin"))
    }
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(user_id) = header(parts, USER_ID_HEADER) else {
            warn!(path = %parts.uri.path(), "Request without caller identity");
            return Err(ApiError::Unauthorized);
        };
        Ok(CallerIdentity {
            user_id,
            username: header(parts, USER_NAME_HEADER),
            role: header(parts, USER_ROLE_HEADER),
        })
    }
}

/// A caller with the admin role.
pub struct RequireAdmin(pub CallerIdentity);

#[async_trait]
impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let caller = CallerIdentity::from_request_parts(parts, state).await?;
        if !caller.is_admin() {
            warn!(user = %caller.user_id, path = %parts.uri.path(), "Admin route refused");
            return Err(ApiError::Forbidden);
        }
        Ok(RequireAdmin(caller))
    }
}
