//! Token validation and user resolution.
//!
//! The auth middleware depends only on the [`TokenValidator`] and
//! [`UserResolver`] traits. This module also carries the implementations the
//! binary wires up: an HS256 JWT validator, the development mock, and an
//! in-process resolver.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::claims::TokenClaims;

/// Role that marks a system administrator.
pub const SYSTEM_ADMIN_ROLE: &str = "system-admin";

/// Username used by the development mock.
pub const MOCK_USERNAME: &str = "dev-user";

/// Email used by the development mock.
pub const MOCK_EMAIL: &str = "dev@flowra.local";

/// Authentication failures. All of them end in the unauthenticated branch.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("unable to resolve user: {0}")]
    UnresolvableUser(String),

    #[error("authentication timed out")]
    Timeout,
}

/// Checks a session token and returns its claims.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError>;
}

/// Maps an external identity to an internal user id, provisioning if needed.
#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve(
        &self,
        external_id: &str,
        username: &str,
        email: &str,
    ) -> Result<Uuid, AuthError>;
}

/// Development validator that trusts any non-empty token.
///
/// The user id is derived from the token, so the same token always maps to
/// the same user. Only wired up when mock auth is explicitly allowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockTokenValidator;

impl MockTokenValidator {
    /// The stable user id for `token`.
    pub fn user_id_for(token: &str) -> Uuid {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }
}

#[async_trait]
impl TokenValidator for MockTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken("empty token".to_string()));
        }
        let user_id = Self::user_id_for(token);
        Ok(TokenClaims {
            user_id,
            external_user_id: format!("mock-{user_id}"),
            username: MOCK_USERNAME.to_string(),
            email: MOCK_EMAIL.to_string(),
            roles: Vec::new(),
            groups: Vec::new(),
            is_system_admin: false,
            raw: serde_json::json!({ "sub": format!("mock-{user_id}"), "mock": true }),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// The claim shape issued by the identity provider.
#[derive(Debug, Deserialize)]
struct ProviderClaims {
    sub: String,
    #[serde(default)]
    preferred_username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
    #[serde(default)]
    groups: Vec<String>,
}

/// Validates HS256-signed JWTs from the identity provider.
///
/// Produces claims without an internal user id; the resolver fills it in.
pub struct JwtTokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenValidator {
    /// Create a validator for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require the `aud` claim to contain `audience`.
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }
}

#[async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let data = jsonwebtoken::decode::<serde_json::Value>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let claims: ProviderClaims = serde_json::from_value(data.claims.clone())
            .map_err(|e| AuthError::InvalidToken(format!("unexpected claims: {e}")))?;

        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        let roles = claims.realm_access.unwrap_or_default().roles;
        let is_system_admin = roles.iter().any(|r| r == SYSTEM_ADMIN_ROLE);

        Ok(TokenClaims {
            user_id: Uuid::nil(),
            external_user_id: claims.sub,
            username: claims.preferred_username,
            email: claims.email,
            roles,
            groups: claims.groups,
            is_system_admin,
            raw: data.claims,
        })
    }
}

impl std::fmt::Debug for JwtTokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenValidator")
            .field("iss", &self.validation.iss)
            .field("aud", &self.validation.aud)
            .finish_non_exhaustive()
    }
}

/// Resolver that provisions users in process memory.
///
/// Suitable for single-instance deployments and tests; the first sighting of
/// an external id allocates a new internal id.
#[derive(Debug, Default)]
pub struct InMemoryUserResolver {
    ids: DashMap<String, Uuid>,
}

impl InMemoryUserResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of provisioned users.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[async_trait]
impl UserResolver for InMemoryUserResolver {
    async fn resolve(
        &self,
        external_id: &str,
        username: &str,
        _email: &str,
    ) -> Result<Uuid, AuthError> {
        if external_id.is_empty() {
            return Err(AuthError::UnresolvableUser("empty external id".to_string()));
        }
        let id = *self.ids.entry(external_id.to_string()).or_insert_with(|| {
            let id = Uuid::now_v7();
            debug!(external_id = %external_id, username = %username, user_id = %id, "provisioned user");
            id
        });
        Ok(id)
    }
}
