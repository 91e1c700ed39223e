//! OAuth2 authorization code client.
//!
//! Builds provider authorization URLs and exchanges authorization codes for
//! access tokens. Also owns the CSRF state helpers used by the login and
//! callback routes.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Session lifetime when the provider omits `expires_in`.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

/// Random bytes in a CSRF state value.
const STATE_BYTES: usize = 16;

/// Scopes requested when none are configured.
pub const DEFAULT_SCOPES: &str = "openid profile email";

/// Failures talking to the identity provider.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("invalid provider url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Tokens granted by the provider.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenGrant {
    /// Cookie lifetime for the access token.
    pub fn session_max_age(&self) -> i64 {
        self.expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_SESSION_TTL_SECS)
    }
}

/// Identity provider client.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// The URL the browser is sent to for login.
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> String;

    /// Trade an authorization code for tokens.
    async fn exchange_code(&self, code: &str, redirect_uri: &str)
    -> Result<TokenGrant, OAuthError>;
}

/// Provider settings.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: String,
}

/// Standard authorization code flow over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOAuthClient {
    authorize_url: Url,
    token_url: Url,
    client_id: String,
    client_secret: Option<String>,
    scopes: String,
    http: reqwest::Client,
}

impl HttpOAuthClient {
    pub fn new(settings: OAuthSettings) -> Result<Self, OAuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(3))
            .build()?;

        Ok(Self {
            authorize_url: Url::parse(&settings.authorize_url)?,
            token_url: Url::parse(&settings.token_url)?,
            client_id: settings.client_id,
            client_secret: settings.client_secret,
            scopes: settings.scopes,
            http,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.scopes)
            .append_pair("state", state);
        url.into()
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, OAuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(self.token_url.clone())
            .header("accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let reason = serde_json::from_str::<ProviderError>(&body)
                .map(|e| match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                })
                .unwrap_or_else(|_| format!("status {status}"));
            return Err(OAuthError::Rejected(reason));
        }

        let grant: TokenGrant =
            serde_json::from_str(&body).map_err(|e| OAuthError::Malformed(e.to_string()))?;
        if grant.access_token.is_empty() {
            return Err(OAuthError::Malformed("empty access_token".to_string()));
        }

        debug!(expires_in = ?grant.expires_in, "authorization code exchanged");
        Ok(grant)
    }
}

/// Fresh CSRF state: 16 random bytes, URL-safe base64 without padding.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare a returned state with the stored one in constant time.
///
/// An empty stored state never matches.
pub fn states_match(expected: &str, supplied: &str) -> bool {
    use subtle::ConstantTimeEq;

    if expected.is_empty() {
        return false;
    }
    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}
