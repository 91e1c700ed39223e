//! Per-workspace rate limiting.
//!
//! Every workspace gets one counter, `ws:<id>`, capped by its override or the
//! base limit. No burst applies. Requests without a workspace in context are
//! not limited here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::rate_limit::{DEFAULT_STORE_TIMEOUT, check_window, rate_limit_response};
use crate::clock::{SharedClock, system_clock};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::store::SharedStore;

/// Message in the workspace 429 body.
pub const WORKSPACE_LIMIT_MESSAGE: &str =
    "Workspace rate limit exceeded. Please try again later.";

/// Header clients may use to name the workspace instead of the path.
pub const WORKSPACE_HEADER: &str = "x-workspace-id";

/// The workspace a request operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspaceId(pub Uuid);

/// Workspace-scoped limiter with per-workspace overrides.
pub struct WorkspaceRateLimiter {
    store: Option<SharedStore>,
    limit: u64,
    window: Duration,
    overrides: RwLock<HashMap<Uuid, u64>>,
    store_timeout: Duration,
    clock: SharedClock,
    metrics: Option<Arc<Metrics>>,
}

impl WorkspaceRateLimiter {
    /// `limit` requests per `window` for every workspace without an override.
    pub fn new(store: Option<SharedStore>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            overrides: RwLock::new(HashMap::new()),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            clock: system_clock(),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Give `workspace` its own limit.
    pub fn set_limit(&self, workspace: Uuid, limit: u64) {
        self.overrides.write().insert(workspace, limit);
    }

    /// Drop the override for `workspace`.
    pub fn remove_limit(&self, workspace: Uuid) {
        self.overrides.write().remove(&workspace);
    }

    /// The cap for `workspace`.
    pub fn get_limit(&self, workspace: Uuid) -> u64 {
        self.overrides
            .read()
            .get(&workspace)
            .copied()
            .unwrap_or(self.limit)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Gate one request.
    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let Some(store) = self.store.as_ref() else {
            return next.run(request).await;
        };

        let Some(WorkspaceId(workspace)) = request.extensions().get::<WorkspaceId>().copied()
        else {
            return next.run(request).await;
        };

        let key = format!("ws:{workspace}");
        let cap = self.get_limit(workspace);

        let status = match check_window(
            store.as_ref(),
            &key,
            cap,
            self.window,
            self.store_timeout,
            self.clock.as_ref(),
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, workspace = %workspace, "workspace rate limit check failed, allowing request");
                if let Some(metrics) = &self.metrics {
                    metrics.record_store_error();
                }
                return next.run(request).await;
            }
        };

        if status.exceeded() {
            debug!(workspace = %workspace, count = status.count, cap, "workspace rate limit exceeded");
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limit("workspace");
            }
            let mut response = rate_limit_response(WORKSPACE_LIMIT_MESSAGE);
            status.apply_exceeded_headers(response.headers_mut());
            return response;
        }

        let mut response = next.run(request).await;
        status.apply_headers(response.headers_mut());
        response
    }
}

impl std::fmt::Debug for WorkspaceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("overrides", &self.overrides.read().len())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

/// Middleware entry point for `axum::middleware::from_fn_with_state`.
pub async fn workspace_rate_limit(
    State(limiter): State<Arc<WorkspaceRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    limiter.handle(request, next).await
}

/// Find the workspace id named by a request.
///
/// The `X-Workspace-ID` header wins over a `/workspaces/{id}` path segment.
/// Returns `Ok(None)` when neither is present.
pub fn workspace_id_from_request(request: &Request) -> Result<Option<Uuid>, AppError> {
    let raw = match request.headers().get(WORKSPACE_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| AppError::BadRequest("invalid workspace id".to_string()))?
                .trim()
                .to_string(),
        ),
        None => {
            let mut segments = request.uri().path().split('/').filter(|s| !s.is_empty());
            segments
                .by_ref()
                .find(|s| *s == "workspaces")
                .and_then(|_| segments.next())
                .map(str::to_string)
        }
    };

    match raw {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|_| AppError::BadRequest(format!("invalid workspace id: {raw}"))),
    }
}

/// Middleware that puts the request's [`WorkspaceId`] into context.
///
/// A malformed id is rejected with 400.
pub async fn extract_workspace_id(mut request: Request, next: Next) -> Response {
    match workspace_id_from_request(&request) {
        Ok(Some(id)) => {
            request.extensions_mut().insert(WorkspaceId(id));
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
