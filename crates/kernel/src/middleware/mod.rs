//! HTTP middleware components.
//!
//! Rate limiting on several key dimensions, per-workspace quotas, and session
//! authentication.

pub mod auth;
pub mod endpoint_limits;
pub mod rate_limit;
pub mod workspace_limit;

pub use auth::{AuthConfig, AuthMiddleware, optional_auth, require_auth};
pub use endpoint_limits::EndpointRateLimits;
pub use rate_limit::{
    KeyStrategy, RateLimitConfig, RateLimiter, get_client_id, rate_limit, rate_limit_response,
};
pub use workspace_limit::{
    WorkspaceId, WorkspaceRateLimiter, extract_workspace_id, workspace_rate_limit,
};
