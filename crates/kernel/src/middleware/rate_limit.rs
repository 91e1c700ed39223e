//! Rate limiting middleware.
//!
//! Fixed-window counters with burst headroom. Each [`RateLimiter`] owns one
//! keying strategy; chain several with `from_fn_with_state` to limit on more
//! than one dimension. A failing store never blocks traffic: the request is
//! logged and let through.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::AuthUser;
use crate::clock::{Clock, SharedClock, system_clock};
use crate::metrics::Metrics;
use crate::middleware::workspace_limit::WorkspaceId;
use crate::store::{RateLimitStore, SharedStore, StoreError, with_deadline};

/// Message in the default 429 body.
pub const DEFAULT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Error code in every 429 body this module produces.
pub const RATE_LIMIT_CODE: &str = "RATE_LIMIT_EXCEEDED";

/// Deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Maps a request to its counter key. `None` skips limiting.
pub type KeyFn = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Builds the response for a request over quota, given the time to reset.
pub type ExceedFn = Arc<dyn Fn(&Request, Duration) -> Response + Send + Sync>;

/// Per-request base limit, used in place of the fixed `limit`.
pub type LimitFn = Arc<dyn Fn(&Request) -> u64 + Send + Sync>;

/// How a request is mapped to a counter.
#[derive(Clone)]
pub enum KeyStrategy {
    /// One counter for everything.
    Global,
    /// `user:<id>` for authenticated requests; anonymous requests skip.
    ByUser,
    /// `ip:<client ip>`.
    ByIp,
    /// `<method>:<path>:<client ip>`.
    ByEndpoint,
    /// `workspace:<id>` when a workspace is in context; otherwise skip.
    ByWorkspace,
    /// Caller-supplied.
    Custom(KeyFn),
}

impl KeyStrategy {
    /// Wrap a closure as a custom strategy.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(f))
    }

    /// Compute the key for `request`.
    pub fn key(&self, request: &Request) -> Option<String> {
        match self {
            KeyStrategy::Global => Some("global".to_string()),
            KeyStrategy::ByUser => request
                .extensions()
                .get::<AuthUser>()
                .filter(|user| !user.user_id.is_nil())
                .map(|user| format!("user:{}", user.user_id)),
            KeyStrategy::ByIp => Some(format!("ip:{}", client_ip(request))),
            KeyStrategy::ByEndpoint => Some(format!(
                "{}:{}:{}",
                request.method(),
                request.uri().path(),
                client_ip(request)
            )),
            KeyStrategy::ByWorkspace => request
                .extensions()
                .get::<WorkspaceId>()
                .map(|ws| format!("workspace:{}", ws.0)),
            KeyStrategy::Custom(f) => f(request),
        }
    }

    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            KeyStrategy::Global => "global",
            KeyStrategy::ByUser => "user",
            KeyStrategy::ByIp => "ip",
            KeyStrategy::ByEndpoint => "endpoint",
            KeyStrategy::ByWorkspace => "workspace",
            KeyStrategy::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Get the client identifier (IP address) for rate limiting.
///
/// `X-Real-IP` wins, then the first hop of `X-Forwarded-For`, then the
/// connection address.
pub fn get_client_id(addr: Option<SocketAddr>, headers: &HeaderMap) -> String {
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return value.trim().to_string();
    }

    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(ip) = value.split(',').next()
        && !ip.trim().is_empty()
    {
        return ip.trim().to_string();
    }

    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Client IP of a request, honoring proxy headers.
pub fn client_ip(request: &Request) -> String {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    get_client_id(addr, request.headers())
}

/// Default rate limit exceeded response.
pub fn rate_limit_response(message: &str) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "code": RATE_LIMIT_CODE, "message": message })),
    )
        .into_response()
}

/// Immutable settings for one limiter.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Steady-state requests per window.
    pub limit: u64,
    /// Extra requests allowed on top of `limit`.
    pub burst: u64,
    pub window: Duration,
    /// Exact paths that are never limited.
    pub skip_paths: HashSet<String>,
    pub key: KeyStrategy,
    pub exceed: Option<ExceedFn>,
    pub limit_fn: Option<LimitFn>,
    /// No store means the limiter passes everything through.
    pub store: Option<SharedStore>,
    pub message: String,
    pub store_timeout: Duration,
    pub clock: SharedClock,
    /// Label for logs and metrics; defaults to the key strategy name.
    pub name: String,
}

impl RateLimitConfig {
    /// `limit` requests per `window`, keyed by client IP, with no store yet.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            burst: 0,
            window,
            skip_paths: HashSet::new(),
            key: KeyStrategy::ByIp,
            exceed: None,
            limit_fn: None,
            store: None,
            message: DEFAULT_MESSAGE.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            clock: system_clock(),
            name: KeyStrategy::ByIp.name().to_string(),
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Set the keying strategy. Also renames the limiter unless already renamed.
    pub fn with_key(mut self, key: KeyStrategy) -> Self {
        if self.name == self.key.name() {
            self.name = key.name().to_string();
        }
        self.key = key;
        self
    }

    pub fn with_exceed_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, Duration) -> Response + Send + Sync + 'static,
    {
        self.exceed = Some(Arc::new(f));
        self
    }

    pub fn with_limit_fn(mut self, f: LimitFn) -> Self {
        self.limit_fn = Some(f);
        self
    }

    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Effective cap for `request`: base limit plus burst.
    pub fn cap_for(&self, request: &Request) -> u64 {
        let base = self
            .limit_fn
            .as_ref()
            .map_or(self.limit, |limit_fn| limit_fn(request));
        base.saturating_add(self.burst)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60)) // 100 per minute
    }
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("burst", &self.burst)
            .field("window", &self.window)
            .field("skip_paths", &self.skip_paths)
            .field("key", &self.key)
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

/// State of a counter right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    pub count: u64,
    pub cap: u64,
    pub remaining: u64,
    /// Time until the window resets.
    pub ttl: Duration,
    /// Unix seconds at which the window resets.
    pub reset_at: u64,
}

impl WindowStatus {
    fn new(count: u64, cap: u64, ttl: Duration, clock: &dyn Clock) -> Self {
        let reset_at = (clock.system_now() + ttl)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
            .unwrap_or(0);
        Self {
            count,
            cap,
            remaining: cap.saturating_sub(count),
            ttl,
            reset_at,
        }
    }

    /// Whether this request went over the cap.
    pub fn exceeded(&self) -> bool {
        self.count > self.cap
    }

    /// Seconds to wait before retrying, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.ttl.as_secs() + u64::from(self.ttl.subsec_nanos() > 0);
        secs.max(1)
    }

    fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.cap));
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(self.reset_at));
    }

    /// Write the `X-RateLimit-*` headers.
    ///
    /// With stacked limiters the tightest one wins: headers already showing
    /// fewer or equal remaining requests are left alone.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let tighter = headers
            .get(HEADER_REMAINING)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|remaining| remaining <= self.remaining);
        if !tighter {
            self.write_headers(headers);
        }
    }

    /// Write the rate limit headers plus `Retry-After`.
    pub fn apply_exceeded_headers(&self, headers: &mut HeaderMap) {
        self.write_headers(headers);
        headers.insert(HEADER_RETRY_AFTER, HeaderValue::from(self.retry_after_secs()));
    }
}

/// Count one request against `key` and report the window state.
///
/// Shared by every limiter flavor so they agree on the protocol.
pub async fn check_window(
    store: &dyn RateLimitStore,
    key: &str,
    cap: u64,
    window: Duration,
    deadline: Duration,
    clock: &dyn Clock,
) -> Result<WindowStatus, StoreError> {
    let count = with_deadline(deadline, store.increment(key, window)).await?;

    let ttl = match with_deadline(deadline, store.get_ttl(key)).await {
        Ok(ttl) => ttl,
        Err(e) => {
            warn!(error = %e, key = %key, "failed to read rate limit ttl, assuming full window");
            window
        }
    };

    Ok(WindowStatus::new(count, cap, ttl, clock))
}

/// A keyed fixed-window rate limiter.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    config: RateLimitConfig,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_metrics(config, None)
    }

    /// Create a rate limiter that reports rejections and store failures.
    pub fn with_metrics(config: RateLimitConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner { config, metrics }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Gate one request.
    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let config = &self.inner.config;

        let Some(store) = config.store.as_ref() else {
            return next.run(request).await;
        };

        if config.skip_paths.contains(request.uri().path()) {
            return next.run(request).await;
        }

        let Some(key) = config.key.key(&request).filter(|k| !k.is_empty()) else {
            return next.run(request).await;
        };

        let cap = config.cap_for(&request);
        let status = match check_window(
            store.as_ref(),
            &key,
            cap,
            config.window,
            config.store_timeout,
            config.clock.as_ref(),
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                // If the store fails, allow the request (fail open)
                warn!(error = %e, limiter = %config.name, key = %key, "rate limit check failed, allowing request");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_store_error();
                }
                return next.run(request).await;
            }
        };

        if status.exceeded() {
            debug!(
                limiter = %config.name,
                key = %key,
                count = status.count,
                cap = status.cap,
                "rate limit exceeded"
            );
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_rate_limit(&config.name);
            }
            let mut response = match &config.exceed {
                Some(exceed) => exceed(&request, status.ttl),
                None => rate_limit_response(&config.message),
            };
            status.apply_exceeded_headers(response.headers_mut());
            return response;
        }

        let mut response = next.run(request).await;
        status.apply_headers(response.headers_mut());
        response
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Middleware entry point for `axum::middleware::from_fn_with_state`.
pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    limiter.handle(request, next).await
}
