//! Application state and the auth handoff middleware.
//!
//! Session issuance, MFA, and credential verification are handled by an
//! external collaborator upstream. This layer therefore does not
//! authenticate anyone — it trusts an upstream gateway to have already
//! done so and to forward the resolved caller as an `X-User-Id` header
//! (look the caller up, stash the row in the request extensions, let the
//! extractors in `extractors.rs` read it back out). An unknown or missing
//! id simply leaves the extensions empty; routes that need a caller
//! reject via [`crate::extractors::AuthUser`].

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use nimbus_core::{DownloadService, ListingService, ShareService, SseBroadcaster, TreeEngine};
use nimbus_db::repositories::user::UserRepository;

/// Shared services handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tree: TreeEngine,
    pub listing: ListingService,
    pub share: ShareService,
    pub download: DownloadService,
    pub users: UserRepository,
    pub events: SseBroadcaster,
}

/// Resolves `X-User-Id` against the user table and, if found, inserts the
/// row into the request's extensions for downstream extractors.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Response {
    if let Some(user_id) = req
        .headers()
        .get("X-User-Id")
        .and_then(|value| value.to_str().ok())
    {
        if let Ok(Some(user)) = state.users.find_by_id(user_id).await {
            req.extensions_mut().insert(user);
        }
    }

    next.run(req).await
}
