//! The signed-in user.

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{AuthUser, LegacyUser};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct MeResponse {
    user_id: Uuid,
    external_user_id: String,
    username: String,
    email: String,
    roles: Vec<String>,
    groups: Vec<String>,
    is_system_admin: bool,
    user: LegacyUser,
}

/// Identity of the caller. Requires authentication.
async fn me(user: AuthUser) -> Json<MeResponse> {
    let legacy = user.legacy();
    Json(MeResponse {
        user_id: user.user_id,
        external_user_id: user.external_user_id,
        username: user.username,
        email: user.email,
        roles: user.roles,
        groups: user.groups,
        is_system_admin: user.is_system_admin,
        user: legacy,
    })
}

/// Create the router. Mount behind `require_auth`.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/me", get(me))
}
