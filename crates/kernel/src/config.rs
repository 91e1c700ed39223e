//! Configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::services::oauth::{DEFAULT_SCOPES, OAuthSettings};
use crate::store::DEFAULT_PREFIX;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// Redis connection URL. When None, counters live in process memory.
    pub redis_url: Option<String>,

    /// Key prefix for Redis counters (default: "flowra:ratelimit:").
    pub rate_limit_prefix: String,

    /// Per-IP requests per window (default: 100).
    pub rate_limit_requests: u64,

    /// Extra requests on top of the limit (default: 20).
    pub rate_limit_burst: u64,

    /// Rate limit window (default: 60s).
    pub rate_limit_window: Duration,

    /// Paths never rate limited (comma-separated, default: "/health").
    pub rate_limit_skip_paths: Vec<String>,

    /// Requests per window per workspace (default: 1000).
    pub workspace_rate_limit: u64,

    /// Deadline for one store call (default: 250ms).
    pub store_timeout: Duration,

    /// Deadline for token validation plus user lookup (default: 2s).
    pub auth_timeout: Duration,

    /// Accept any session token with synthetic claims. Development only.
    pub allow_mock_auth: bool,

    /// HS256 secret for session JWTs.
    pub jwt_secret: Option<String>,

    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,

    /// Identity provider. None enables the mock code flow.
    pub oauth: Option<OAuthSettings>,

    /// Honor X-Forwarded-Proto when deciding the cookie Secure bit.
    pub trust_forwarded_proto: bool,

    /// Landing page after login (default: /workspaces).
    pub post_login_path: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let redis_url = var("REDIS_URL");

        let rate_limit_prefix =
            var("RATE_LIMIT_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let rate_limit_requests = var("RATE_LIMIT_REQUESTS")
            .unwrap_or_else(|| "100".to_string())
            .parse()
            .context("RATE_LIMIT_REQUESTS must be a valid number")?;

        let rate_limit_burst = var("RATE_LIMIT_BURST")
            .unwrap_or_else(|| "20".to_string())
            .parse()
            .context("RATE_LIMIT_BURST must be a valid number")?;

        let window_secs: u64 = var("RATE_LIMIT_WINDOW_SECS")
            .unwrap_or_else(|| "60".to_string())
            .parse()
            .context("RATE_LIMIT_WINDOW_SECS must be a valid number")?;
        if window_secs == 0 {
            bail!("RATE_LIMIT_WINDOW_SECS must be greater than zero");
        }

        let rate_limit_skip_paths = var("RATE_LIMIT_SKIP_PATHS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["/health".to_string()]);

        let workspace_rate_limit = var("WORKSPACE_RATE_LIMIT")
            .unwrap_or_else(|| "1000".to_string())
            .parse()
            .context("WORKSPACE_RATE_LIMIT must be a valid number")?;

        let store_timeout_ms: u64 = var("STORE_TIMEOUT_MS")
            .unwrap_or_else(|| "250".to_string())
            .parse()
            .context("STORE_TIMEOUT_MS must be a valid number")?;

        let auth_timeout_ms: u64 = var("AUTH_TIMEOUT_MS")
            .unwrap_or_else(|| "2000".to_string())
            .parse()
            .context("AUTH_TIMEOUT_MS must be a valid number")?;

        let allow_mock_auth = parse_bool(var("ALLOW_MOCK_AUTH").as_deref());
        let trust_forwarded_proto = parse_bool(var("TRUST_FORWARDED_PROTO").as_deref());

        let jwt_secret = var("JWT_SECRET");
        if jwt_secret.is_none() && !allow_mock_auth {
            bail!("JWT_SECRET is required unless ALLOW_MOCK_AUTH=true");
        }

        let oauth = match (
            var("OAUTH_AUTHORIZE_URL"),
            var("OAUTH_TOKEN_URL"),
            var("OAUTH_CLIENT_ID"),
        ) {
            (Some(authorize_url), Some(token_url), Some(client_id)) => Some(OAuthSettings {
                authorize_url,
                token_url,
                client_id,
                client_secret: var("OAUTH_CLIENT_SECRET"),
                scopes: var("OAUTH_SCOPES").unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
            }),
            (None, None, None) => None,
            _ => bail!(
                "OAUTH_AUTHORIZE_URL, OAUTH_TOKEN_URL and OAUTH_CLIENT_ID must be set together"
            ),
        };

        // The mock login flow issues sessions only the mock validator accepts.
        if jwt_secret.is_some() && oauth.is_none() {
            bail!(
                "JWT_SECRET requires OAUTH_AUTHORIZE_URL, OAUTH_TOKEN_URL and OAUTH_CLIENT_ID; \
                 without a provider use ALLOW_MOCK_AUTH=true"
            );
        }

        let post_login_path = var("POST_LOGIN_PATH").unwrap_or_else(|| "/workspaces".to_string());
        if !post_login_path.starts_with('/') {
            bail!("POST_LOGIN_PATH must be a local path");
        }

        Ok(Self {
            port,
            redis_url,
            rate_limit_prefix,
            rate_limit_requests,
            rate_limit_burst,
            rate_limit_window: Duration::from_secs(window_secs),
            rate_limit_skip_paths,
            workspace_rate_limit,
            store_timeout: Duration::from_millis(store_timeout_ms),
            auth_timeout: Duration::from_millis(auth_timeout_ms),
            allow_mock_auth,
            jwt_secret,
            jwt_issuer: var("JWT_ISSUER"),
            jwt_audience: var("JWT_AUDIENCE"),
            oauth,
            trust_forwarded_proto,
            post_login_path,
        })
    }
}

fn parse_bool(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}
