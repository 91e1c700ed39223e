//! HTTP route handlers.

pub mod health;
pub mod me;
pub mod metrics;
pub mod oauth;
pub mod workspace;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};

use crate::middleware::{
    extract_workspace_id, rate_limit, require_auth, workspace_rate_limit,
};
use crate::state::AppState;

/// Assemble the application router.
///
/// Request flow (outermost first):
/// per-IP limiter → endpoint limiter → routes.
/// Authenticated routes add: require_auth → per-user limiter →
/// workspace extraction → workspace limiter → handler.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(me::router())
        .merge(workspace::router())
        .route_layer(from_fn_with_state(
            state.workspace_limiter().clone(),
            workspace_rate_limit,
        ))
        .route_layer(from_fn(extract_workspace_id))
        .route_layer(from_fn_with_state(state.user_limiter().clone(), rate_limit))
        .route_layer(from_fn_with_state(state.auth().clone(), require_auth));

    let public = Router::new()
        .merge(oauth::router(state.auth().clone()))
        .merge(health::router())
        .merge(metrics::router());

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(from_fn_with_state(
            state.endpoint_limiter().clone(),
            rate_limit,
        ))
        .layer(from_fn_with_state(state.ip_limiter().clone(), rate_limit))
        .with_state(state)
}
