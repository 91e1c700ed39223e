//! Identity carried from token validation into the request.

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Validated claims for a session token.
///
/// `user_id` is nil when the validator only knows the external identity;
/// the auth middleware then asks the user resolver for the internal id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: Uuid,
    pub external_user_id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub is_system_admin: bool,
    /// The claims object exactly as the validator saw it.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl TokenClaims {
    /// Whether the internal id still has to be looked up.
    pub fn needs_resolution(&self) -> bool {
        self.user_id.is_nil()
    }

    /// Whether the claims carry `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Display-oriented view of the user, kept for pages that still expect it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyUser {
    pub id: String,
    pub email: String,
    pub username: String,
    pub display_name: String,
}

/// The authenticated user for the current request.
///
/// Inserted into request extensions by the auth middleware. Handlers take it
/// as an extractor; `Option<AuthUser>` works behind optional auth.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub external_user_id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub is_system_admin: bool,
    pub raw_claims: serde_json::Value,
}

impl AuthUser {
    /// Build from fully resolved claims.
    pub fn from_claims(claims: TokenClaims) -> Self {
        Self {
            user_id: claims.user_id,
            external_user_id: claims.external_user_id,
            username: claims.username,
            email: claims.email,
            roles: claims.roles,
            groups: claims.groups,
            is_system_admin: claims.is_system_admin,
            raw_claims: claims.raw,
        }
    }

    /// The legacy display map. `display_name` falls back to the email.
    pub fn legacy(&self) -> LegacyUser {
        let display_name = if self.username.is_empty() {
            self.email.clone()
        } else {
            self.username.clone()
        };
        LegacyUser {
            id: self.user_id.to_string(),
            email: self.email.clone(),
            username: self.username.clone(),
            display_name,
        }
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

impl<S> OptionalFromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthUser>().cloned())
    }
}
