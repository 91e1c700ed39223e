//! Application state shared across all handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::Client as RedisClient;
use tracing::{info, warn};

use crate::auth::{InMemoryUserResolver, JwtTokenValidator, TokenValidator};
use crate::clock::{SharedClock, system_clock};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::middleware::auth::{AuthConfig, AuthMiddleware, LOGIN_PATH};
use crate::middleware::rate_limit::DEFAULT_STORE_TIMEOUT;
use crate::middleware::{
    EndpointRateLimits, KeyStrategy, RateLimitConfig, RateLimiter, WorkspaceRateLimiter,
};
use crate::pages::Pages;
use crate::services::oauth::{HttpOAuthClient, OAuthClient};
use crate::store::memory::MAX_REAP_INTERVAL;
use crate::store::{MemoryStore, RedisStore, SharedStore};

/// Everything needed to assemble an [`AppState`].
///
/// [`AppState::new`] fills this from [`Config`]; tests build it directly.
pub struct StateOptions {
    /// No store disables every limiter.
    pub store: Option<SharedStore>,
    pub clock: SharedClock,
    pub limit: u64,
    pub burst: u64,
    pub window: Duration,
    pub skip_paths: Vec<String>,
    pub workspace_limit: u64,
    pub store_timeout: Duration,
    pub endpoint_limits: Arc<EndpointRateLimits>,
    pub auth: AuthConfig,
    /// No client enables the mock code flow.
    pub oauth: Option<Arc<dyn OAuthClient>>,
    pub post_login_path: String,
    pub redis: Option<RedisClient>,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            store: None,
            clock: system_clock(),
            limit: 100,
            burst: 20,
            window: Duration::from_secs(60),
            skip_paths: vec!["/health".to_string()],
            workspace_limit: 1000,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            endpoint_limits: Arc::new(EndpointRateLimits::new()),
            auth: AuthConfig::default(),
            oauth: None,
            post_login_path: "/workspaces".to_string(),
            redis: None,
        }
    }
}

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    metrics: Arc<Metrics>,
    ip_limiter: RateLimiter,
    endpoint_limiter: RateLimiter,
    user_limiter: RateLimiter,
    endpoint_limits: Arc<EndpointRateLimits>,
    workspace_limiter: Arc<WorkspaceRateLimiter>,
    auth: AuthMiddleware,
    oauth: Option<Arc<dyn OAuthClient>>,
    pages: Pages,
    post_login_path: String,
    store_kind: &'static str,
    redis: Option<RedisClient>,
}

impl AppState {
    /// Build state from configuration, connecting to Redis when configured.
    pub async fn new(config: &Config) -> Result<Self> {
        let clock = system_clock();

        let (store, redis): (SharedStore, Option<RedisClient>) = match &config.redis_url {
            Some(url) => {
                let client = RedisClient::open(url.as_str()).context("failed to create Redis client")?;
                let store = RedisStore::new(client.clone()).with_prefix(&config.rate_limit_prefix);
                info!(prefix = %config.rate_limit_prefix, "using Redis rate limit store");
                (Arc::new(store), Some(client))
            }
            None => {
                let store = MemoryStore::with_clock(clock.clone());
                let interval = (config.rate_limit_window / 2).min(MAX_REAP_INTERVAL);
                store.spawn_reaper(interval);
                info!(?interval, "using in-memory rate limit store");
                (Arc::new(store), None)
            }
        };

        let validator: Option<Arc<dyn TokenValidator>> = config.jwt_secret.as_ref().map(|secret| {
            let mut validator = JwtTokenValidator::new(secret.as_bytes());
            if let Some(issuer) = &config.jwt_issuer {
                validator = validator.with_issuer(issuer);
            }
            if let Some(audience) = &config.jwt_audience {
                validator = validator.with_audience(audience);
            }
            Arc::new(validator) as Arc<dyn TokenValidator>
        });
        if validator.is_none() && config.allow_mock_auth {
            warn!("no JWT secret configured, accepting any session token with mock claims");
        }

        let oauth = match &config.oauth {
            Some(settings) => {
                let client =
                    HttpOAuthClient::new(settings.clone()).context("failed to create OAuth client")?;
                Some(Arc::new(client) as Arc<dyn OAuthClient>)
            }
            None => {
                warn!("no OAuth provider configured, login uses the mock code flow");
                None
            }
        };

        let endpoint_limits = Arc::new(EndpointRateLimits::new());
        endpoint_limits.set("GET:/login", 30);
        endpoint_limits.set("GET:/auth/callback", 10);

        Self::from_options(StateOptions {
            store: Some(store),
            clock,
            limit: config.rate_limit_requests,
            burst: config.rate_limit_burst,
            window: config.rate_limit_window,
            skip_paths: config.rate_limit_skip_paths.clone(),
            workspace_limit: config.workspace_rate_limit,
            store_timeout: config.store_timeout,
            endpoint_limits,
            auth: AuthConfig {
                validator,
                resolver: Some(Arc::new(InMemoryUserResolver::new())),
                allow_mock_auth: config.allow_mock_auth,
                timeout: config.auth_timeout,
                trust_forwarded_proto: config.trust_forwarded_proto,
                login_path: LOGIN_PATH.to_string(),
            },
            oauth,
            post_login_path: config.post_login_path.clone(),
            redis,
        })
    }

    /// Assemble state from explicit parts.
    pub fn from_options(options: StateOptions) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());

        let base = |limit: u64| {
            let mut config = RateLimitConfig::new(limit, options.window)
                .with_skip_paths(options.skip_paths.iter().cloned())
                .with_store_timeout(options.store_timeout)
                .with_clock(options.clock.clone());
            if let Some(store) = &options.store {
                config = config.with_store(store.clone());
            }
            config
        };

        let ip_limiter = RateLimiter::with_metrics(
            base(options.limit)
                .with_burst(options.burst)
                .with_key(KeyStrategy::ByIp),
            Some(metrics.clone()),
        );

        let endpoint_limiter = RateLimiter::with_metrics(
            base(options.limit)
                .with_key(options.endpoint_limits.key_strategy())
                .with_limit_fn(options.endpoint_limits.limit_fn(options.limit))
                .with_name("endpoint"),
            Some(metrics.clone()),
        );

        let user_limiter = RateLimiter::with_metrics(
            base(options.limit)
                .with_burst(options.burst)
                .with_key(KeyStrategy::ByUser),
            Some(metrics.clone()),
        );

        let workspace_limiter = Arc::new(
            WorkspaceRateLimiter::new(
                options.store.clone(),
                options.workspace_limit,
                options.window,
            )
            .with_clock(options.clock.clone())
            .with_store_timeout(options.store_timeout)
            .with_metrics(metrics.clone()),
        );

        let pages = Pages::new(&options.auth.login_path)?;
        let auth = AuthMiddleware::with_metrics(options.auth, Some(metrics.clone()));

        let store_kind = match (&options.store, &options.redis) {
            (None, _) => "none",
            (Some(_), Some(_)) => "redis",
            (Some(_), None) => "memory",
        };

        Ok(Self {
            inner: Arc::new(AppStateInner {
                metrics,
                ip_limiter,
                endpoint_limiter,
                user_limiter,
                endpoint_limits: options.endpoint_limits,
                workspace_limiter,
                auth,
                oauth: options.oauth,
                pages,
                post_login_path: options.post_login_path,
                store_kind,
                redis: options.redis,
            }),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Per-IP limiter applied to every route.
    pub fn ip_limiter(&self) -> &RateLimiter {
        &self.inner.ip_limiter
    }

    /// Limiter for method+path overrides.
    pub fn endpoint_limiter(&self) -> &RateLimiter {
        &self.inner.endpoint_limiter
    }

    /// Per-user limiter applied behind authentication.
    pub fn user_limiter(&self) -> &RateLimiter {
        &self.inner.user_limiter
    }

    pub fn endpoint_limits(&self) -> &Arc<EndpointRateLimits> {
        &self.inner.endpoint_limits
    }

    pub fn workspace_limiter(&self) -> &Arc<WorkspaceRateLimiter> {
        &self.inner.workspace_limiter
    }

    pub fn auth(&self) -> &AuthMiddleware {
        &self.inner.auth
    }

    pub fn oauth(&self) -> Option<&Arc<dyn OAuthClient>> {
        self.inner.oauth.as_ref()
    }

    pub fn pages(&self) -> &Pages {
        &self.inner.pages
    }

    pub fn post_login_path(&self) -> &str {
        &self.inner.post_login_path
    }

    /// "redis", "memory" or "none".
    pub fn store_kind(&self) -> &'static str {
        self.inner.store_kind
    }

    /// Check Redis connectivity. True when Redis is not in use.
    pub async fn redis_healthy(&self) -> bool {
        let Some(redis) = &self.inner.redis else {
            return true;
        };
        let Ok(mut conn) = redis.get_multiplexed_async_connection().await else {
            return false;
        };

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.inner.store_kind)
            .field("auth", &self.inner.auth)
            .field("has_oauth", &self.inner.oauth.is_some())
            .finish_non_exhaustive()
    }
}
