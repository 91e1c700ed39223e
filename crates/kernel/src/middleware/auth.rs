//! Session authentication middleware.
//!
//! Reads the `flowra_session` cookie, validates it, resolves the internal
//! user id and puts [`AuthUser`] plus [`LegacyUser`] into request extensions.
//! [`require_auth`] stops unauthenticated requests; [`optional_auth`] lets
//! them through without identity.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

use crate::auth::{
    AuthError, AuthUser, CookieJar, MockTokenValidator, TokenValidator, UserResolver,
    request_is_secure,
};
use crate::error::AppError;
use crate::metrics::Metrics;

/// Where unauthenticated browsers are sent.
pub const LOGIN_PATH: &str = "/login";

/// Default deadline for validation plus user resolution.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(2);

pub const HX_REQUEST: &str = "hx-request";
pub const HX_REDIRECT: &str = "hx-redirect";

/// Whether the request comes from a fragment (HTMX) client.
pub fn is_htmx(headers: &HeaderMap) -> bool {
    headers
        .get(HX_REQUEST)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// A `302 Found` to `location`.
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => AppError::BadRequest("invalid redirect location".to_string()).into_response(),
    }
}

/// Settings for the auth middleware.
#[derive(Clone)]
pub struct AuthConfig {
    /// `None` means no real validator; see `allow_mock_auth`.
    pub validator: Option<Arc<dyn TokenValidator>>,
    pub resolver: Option<Arc<dyn UserResolver>>,
    /// Fall back to deterministic mock claims when no validator is set.
    pub allow_mock_auth: bool,
    /// Bound on validation plus resolution.
    pub timeout: Duration,
    pub trust_forwarded_proto: bool,
    pub login_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            validator: None,
            resolver: None,
            allow_mock_auth: false,
            timeout: DEFAULT_AUTH_TIMEOUT,
            trust_forwarded_proto: false,
            login_path: LOGIN_PATH.to_string(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("has_validator", &self.validator.is_some())
            .field("has_resolver", &self.resolver.is_some())
            .field("allow_mock_auth", &self.allow_mock_auth)
            .field("timeout", &self.timeout)
            .field("trust_forwarded_proto", &self.trust_forwarded_proto)
            .field("login_path", &self.login_path)
            .finish()
    }
}

/// What the session cookie amounted to.
enum Identity {
    Authenticated(Box<AuthUser>),
    Missing,
    Rejected,
}

/// Session authentication shared by both middleware flavors.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AuthMiddleware {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    config: AuthConfig,
    validator: Option<Arc<dyn TokenValidator>>,
    metrics: Option<Arc<Metrics>>,
}

impl AuthMiddleware {
    pub fn new(config: AuthConfig) -> Self {
        Self::with_metrics(config, None)
    }

    pub fn with_metrics(config: AuthConfig, metrics: Option<Arc<Metrics>>) -> Self {
        let validator = match (&config.validator, config.allow_mock_auth) {
            (Some(validator), _) => Some(Arc::clone(validator)),
            (None, true) => Some(Arc::new(MockTokenValidator) as Arc<dyn TokenValidator>),
            (None, false) => None,
        };
        Self {
            inner: Arc::new(AuthInner {
                config,
                validator,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// Whether tokens go through the development mock.
    pub fn uses_mock(&self) -> bool {
        self.inner.config.validator.is_none() && self.inner.validator.is_some()
    }

    /// Validate `token` and resolve its user, within the configured deadline.
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser, AuthError> {
        let validator = self
            .inner
            .validator
            .as_ref()
            .ok_or_else(|| AuthError::InvalidToken("no token validator configured".to_string()))?;

        let work = async {
            let mut claims = validator.validate(token).await?;
            if claims.needs_resolution() {
                let resolver = self.inner.config.resolver.as_ref().ok_or_else(|| {
                    AuthError::UnresolvableUser("no user resolver configured".to_string())
                })?;
                claims.user_id = resolver
                    .resolve(&claims.external_user_id, &claims.username, &claims.email)
                    .await?;
                if claims.user_id.is_nil() {
                    return Err(AuthError::UnresolvableUser(
                        "resolver returned a nil id".to_string(),
                    ));
                }
            }
            Ok(AuthUser::from_claims(claims))
        };

        tokio::time::timeout(self.inner.config.timeout, work)
            .await
            .map_err(|_| AuthError::Timeout)?
    }

    fn jar_for(&self, request: &Request) -> CookieJar {
        let secure = request_is_secure(
            request.headers(),
            request.uri(),
            self.inner.config.trust_forwarded_proto,
        );
        CookieJar::from_headers(request.headers(), secure)
    }

    async fn identify(&self, jar: &mut CookieJar) -> Identity {
        let Some(token) = jar.session().map(str::to_string) else {
            return Identity::Missing;
        };

        match self.authenticate(&token).await {
            Ok(user) => Identity::Authenticated(Box::new(user)),
            Err(e) => {
                debug!(error = %e, "session rejected");
                jar.clear_session();
                Identity::Rejected
            }
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_auth_failure();
        }
    }

    /// Response for a request without a usable session.
    ///
    /// Fragment clients get 401 JSON with `Hx-Redirect`; browsers get a 302
    /// to the login page, and a GET also remembers where it was going.
    pub fn unauthenticated_response(&self, request: &Request, mut jar: CookieJar) -> Response {
        let login = self.inner.config.login_path.as_str();

        let response = if is_htmx(request.headers()) {
            let mut response = (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Authentication required" })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(login) {
                response.headers_mut().insert(HX_REDIRECT, value);
            }
            response
        } else {
            if request.method() == Method::GET {
                let target = request
                    .uri()
                    .path_and_query()
                    .map_or_else(|| request.uri().path(), |pq| pq.as_str());
                jar.set_redirect(target);
            }
            found(login)
        };

        jar.into_response_with(response)
    }

    /// Gate a request that must be authenticated.
    pub async fn require(&self, mut request: Request, next: Next) -> Response {
        let mut jar = self.jar_for(&request);
        match self.identify(&mut jar).await {
            Identity::Authenticated(user) => {
                attach(&mut request, *user);
                next.run(request).await
            }
            Identity::Missing | Identity::Rejected => {
                self.record_failure();
                self.unauthenticated_response(&request, jar)
            }
        }
    }

    /// Attach identity when possible, then always call the handler.
    pub async fn optional(&self, mut request: Request, next: Next) -> Response {
        let mut jar = self.jar_for(&request);
        if let Identity::Authenticated(user) = self.identify(&mut jar).await {
            attach(&mut request, *user);
        }
        let response = next.run(request).await;
        jar.into_response_with(response)
    }
}

impl std::fmt::Debug for AuthMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMiddleware")
            .field("config", &self.inner.config)
            .field("uses_mock", &self.uses_mock())
            .finish()
    }
}

fn attach(request: &mut Request<Body>, user: AuthUser) {
    let legacy = user.legacy();
    request.extensions_mut().insert(legacy);
    request.extensions_mut().insert(user);
}

/// Middleware entry point: reject unauthenticated requests.
pub async fn require_auth(
    State(auth): State<AuthMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    auth.require(request, next).await
}

/// Middleware entry point: attach identity if the session is valid.
pub async fn optional_auth(
    State(auth): State<AuthMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    auth.optional(request, next).await
}

static GLOBAL_AUTH: OnceLock<AuthMiddleware> = OnceLock::new();

/// Install the process-wide auth middleware.
///
/// Set once at startup before serving; returns `false` if already set.
/// Prefer passing [`AuthMiddleware`] as router state.
pub fn init_global(auth: AuthMiddleware) -> bool {
    GLOBAL_AUTH.set(auth).is_ok()
}

/// The process-wide auth middleware, if installed.
pub fn global() -> Option<&'static AuthMiddleware> {
    GLOBAL_AUTH.get()
}

/// [`require_auth`] for routers that cannot carry the middleware as state.
pub async fn require_auth_global(request: Request, next: Next) -> Response {
    match global() {
        Some(auth) => auth.require(request, next).await,
        None => AppError::Internal(anyhow::anyhow!("auth middleware not initialized"))
            .into_response(),
    }
}
