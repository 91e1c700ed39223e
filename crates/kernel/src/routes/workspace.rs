//! Workspace landing endpoints.
//!
//! Thin handlers that sit behind authentication and the workspace limiter.

use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{AuthUser, LegacyUser};
use crate::error::{AppError, AppResult};
use crate::middleware::WorkspaceId;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct WorkspacesResponse {
    user: LegacyUser,
}

#[derive(Debug, Serialize)]
struct WorkspaceResponse {
    workspace_id: Uuid,
    user_id: Uuid,
}

/// Post-login landing page.
async fn list(Extension(user): Extension<LegacyUser>) -> Json<WorkspacesResponse> {
    Json(WorkspacesResponse { user })
}

/// A single workspace.
async fn show(
    user: AuthUser,
    workspace: Option<Extension<WorkspaceId>>,
    Path(id): Path<String>,
) -> AppResult<Json<WorkspaceResponse>> {
    // The header may name a different workspace than the path.
    let Some(Extension(WorkspaceId(workspace_id))) = workspace else {
        return Err(AppError::BadRequest(format!("invalid workspace id: {id}")));
    };
    if Uuid::parse_str(&id).ok() != Some(workspace_id) {
        return Err(AppError::BadRequest(
            "workspace header does not match path".to_string(),
        ));
    }

    Ok(Json(WorkspaceResponse {
        workspace_id,
        user_id: user.user_id,
    }))
}

/// Create the router. Mount behind `require_auth` and workspace extraction.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/workspaces", get(list))
        .route("/workspaces/{id}", get(show))
}
