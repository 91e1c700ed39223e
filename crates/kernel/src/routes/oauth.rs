//! Login, OAuth callback and logout.
//!
//! Login issues a CSRF state cookie and sends the browser to the identity
//! provider. The callback checks the state, exchanges the code, and writes
//! the session cookie. Without a configured provider the flow short-circuits
//! through a mock code.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::{AuthUser, CookieJar, request_is_secure};
use crate::middleware::auth::{AuthMiddleware, HX_REDIRECT, found, is_htmx, optional_auth};
use crate::services::oauth::{TokenGrant, generate_state, states_match};
use crate::state::AppState;

/// Path the provider redirects back to.
pub const CALLBACK_PATH: &str = "/auth/callback";

/// Code used by the mock flow.
pub const MOCK_CODE: &str = "mock-code";

/// Query parameters on the provider redirect.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}

/// Create the login/logout router.
///
/// Only `/login` runs optional auth, so a stale session cannot clear the
/// cookie the callback is about to write.
pub fn router(auth: AuthMiddleware) -> Router<AppState> {
    Router::new()
        .route("/login", get(login))
        .route_layer(from_fn_with_state(auth, optional_auth))
        .route(CALLBACK_PATH, get(callback))
        .route("/logout", get(logout).post(logout))
}

/// Whether `target` is a same-origin absolute path safe to redirect to.
pub fn is_local_path(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.starts_with("/\\")
        && !target.chars().any(char::is_control)
}

/// `<scheme>://<host>/auth/callback` for this request.
fn redirect_uri(headers: &HeaderMap, uri: &Uri, secure: bool) -> String {
    let scheme = if secure { "https" } else { "http" };
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}{CALLBACK_PATH}")
}

fn cookie_jar(state: &AppState, headers: &HeaderMap, uri: &Uri) -> (CookieJar, bool) {
    let secure = request_is_secure(headers, uri, state.auth().config().trust_forwarded_proto);
    (CookieJar::from_headers(headers, secure), secure)
}

/// Start a login.
async fn login(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(user) = user {
        debug!(user_id = %user.user_id, "already signed in");
        return found(state.post_login_path());
    }

    let (mut jar, secure) = cookie_jar(&state, &headers, &uri);
    let csrf = generate_state();
    jar.set_state(&csrf);

    let authorization_url = match state.oauth() {
        Some(client) => client.authorization_url(&redirect_uri(&headers, &uri, secure), &csrf),
        None => format!("{CALLBACK_PATH}?code={MOCK_CODE}&state={csrf}"),
    };

    jar.into_response_with(state.pages().login(&authorization_url))
}

/// Finish a login.
async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Query(params): Query<CallbackParams>,
) -> Response {
    let (mut jar, secure) = cookie_jar(&state, &headers, &uri);
    let pages = state.pages();
    let metrics = state.metrics();

    if !params.error.is_empty() {
        warn!(error = %params.error, description = %params.error_description, "identity provider returned an error");
        metrics.record_oauth_callback("provider_error");
        return jar.into_response_with(pages.error("The identity provider could not sign you in."));
    }

    let expected = jar.take_state().unwrap_or_default();
    if !states_match(&expected, &params.state) {
        warn!(has_cookie = !expected.is_empty(), "oauth state mismatch");
        metrics.record_oauth_callback("state_mismatch");
        return jar.into_response_with(
            pages.error("Your sign-in request expired or did not match. Please try again."),
        );
    }

    if params.code.is_empty() {
        metrics.record_oauth_callback("missing_code");
        return jar.into_response_with(pages.error("No authorization code was returned."));
    }

    let grant = match state.oauth() {
        Some(client) => {
            let redirect_uri = redirect_uri(&headers, &uri, secure);
            match client.exchange_code(&params.code, &redirect_uri).await {
                Ok(grant) => grant,
                Err(e) => {
                    warn!(error = %e, "authorization code exchange failed");
                    metrics.record_oauth_callback("exchange_failed");
                    return jar.into_response_with(
                        pages.error("We could not complete sign-in. Please try again."),
                    );
                }
            }
        }
        None => TokenGrant {
            access_token: params.code,
            expires_in: None,
            refresh_token: None,
            token_type: None,
        },
    };

    jar.set_session(&grant.access_token, grant.session_max_age());

    let redirect = jar
        .take_redirect()
        .filter(|target| {
            let local = is_local_path(target);
            if !local {
                warn!(target = %target, "ignoring non-local post-login redirect");
            }
            local
        })
        .unwrap_or_else(|| state.post_login_path().to_string());

    metrics.record_oauth_callback("success");
    jar.into_response_with(pages.callback(&redirect))
}

/// Sign out.
///
/// Fragment requests get 200 with `Hx-Redirect`. htmx follows a 302 inside its
/// XHR and swaps the login page into the fragment instead of navigating.
async fn logout(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let (mut jar, _) = cookie_jar(&state, &headers, &uri);
    jar.clear_session();
    jar.clear_redirect();

    let login = state.auth().config().login_path.as_str();
    let response = if is_htmx(&headers) {
        let mut response = StatusCode::OK.into_response();
        if let Ok(value) = HeaderValue::from_str(login) {
            response.headers_mut().insert(HX_REDIRECT, value);
        }
        response
    } else {
        found(login)
    };

    jar.into_response_with(response)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn local_paths_only() {
        assert!(is_local_path("/workspaces"));
        assert!(is_local_path("/workspaces/1?tab=chat"));
        assert!(!is_local_path("//evil.example"));
        assert!(!is_local_path("/\\evil.example"));
        assert!(!is_local_path("https://evil.example"));
        assert!(!is_local_path("workspaces"));
        assert!(!is_local_path("/a\r\nSet-Cookie: x"));
        assert!(!is_local_path("/\t/evil.example"));
        assert!(!is_local_path("/\u{7f}x"));
        assert!(!is_local_path(""));
    }

    #[test]
    fn redirect_uri_uses_host_and_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("app.flowra.test"));
        let uri: Uri = "/login".parse().unwrap();

        assert_eq!(
            redirect_uri(&headers, &uri, true),
            "https://app.flowra.test/auth/callback"
        );
        assert_eq!(
            redirect_uri(&HeaderMap::new(), &uri, false),
            "http://localhost/auth/callback"
        );
    }
}
