//! Request extractors for the authenticated user.
//!
//! [`crate::middleware::auth_middleware`] resolves the caller's identity
//! and stashes the row in the request's extensions; these extractors just
//! read it back out, the usual two-step split for request-scoped
//! authentication middleware.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use nimbus_db::entities::user;

/// An authenticated caller. Rejects with 401 if
/// [`crate::middleware::auth_middleware`] did not populate a user row.
#[derive(Debug, Clone)]
pub struct AuthUser(pub user::Model);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<user::Model>()
            .cloned()
            .map(AuthUser)
            .ok_or((StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

/// The caller's identity, if any was resolved. Used by `/s/:token`, which
/// is reachable unauthenticated but behaves the same either way.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<user::Model>);

impl<S> FromRequestParts<S> for MaybeAuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<user::Model>().cloned()))
    }
}
