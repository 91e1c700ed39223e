//! Session, OAuth state, and post-login redirect cookies.
//!
//! [`CookieJar`] reads the three cookies from a request and collects the
//! `Set-Cookie` headers to attach to the response. Clearing a cookie writes
//! the same name with an empty value and `Max-Age=-1`.

use std::collections::HashMap;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::response::Response;
use tower_sessions::cookie::time::Duration;
use tower_sessions::cookie::{Cookie, SameSite};
use tracing::warn;

/// Bearer token cookie.
pub const SESSION_COOKIE: &str = "flowra_session";

/// CSRF state for the OAuth code flow.
pub const STATE_COOKIE: &str = "flowra_state";

/// Destination captured before redirecting to login.
pub const REDIRECT_COOKIE: &str = "flowra_redirect";

/// Lifetime of the state and redirect cookies.
pub const SHORT_COOKIE_MAX_AGE_SECS: i64 = 300;

/// Whether the request arrived over HTTPS.
///
/// `X-Forwarded-Proto` is only honored when the proxy in front is trusted.
pub fn request_is_secure(headers: &HeaderMap, uri: &Uri, trust_forwarded_proto: bool) -> bool {
    if trust_forwarded_proto
        && let Some(proto) = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
    {
        return proto
            .split(',')
            .next()
            .is_some_and(|p| p.trim().eq_ignore_ascii_case("https"));
    }
    uri.scheme_str() == Some("https")
}

fn is_plain_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x24 | 0x26..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

/// Typed access to the request plane's cookies.
#[derive(Debug, Default)]
pub struct CookieJar {
    incoming: HashMap<String, String>,
    outgoing: Vec<Cookie<'static>>,
    secure: bool,
}

impl CookieJar {
    /// Read cookies from request headers.
    ///
    /// `secure` decides the `Secure` attribute on every cookie this jar sets.
    pub fn from_headers(headers: &HeaderMap, secure: bool) -> Self {
        let mut incoming = HashMap::new();
        for header in headers.get_all(COOKIE) {
            let Ok(value) = header.to_str() else {
                continue;
            };
            for cookie in Cookie::split_parse(value).flatten() {
                incoming
                    .entry(cookie.name().to_string())
                    .or_insert_with(|| cookie.value().to_string());
            }
        }
        Self {
            incoming,
            outgoing: Vec::new(),
            secure,
        }
    }

    /// Whether cookies set through this jar carry `Secure`.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    fn read(&self, name: &str) -> Option<&str> {
        self.incoming
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// The session token, if present and non-empty.
    pub fn session(&self) -> Option<&str> {
        self.read(SESSION_COOKIE)
    }

    /// The OAuth state, if present and non-empty.
    pub fn state(&self) -> Option<&str> {
        self.read(STATE_COOKIE)
    }

    /// The post-login redirect path, decoded.
    pub fn redirect(&self) -> Option<String> {
        let raw = self.read(REDIRECT_COOKIE)?;
        urlencoding::decode(raw).ok().map(|v| v.into_owned())
    }

    /// Write the session cookie. `max_age_secs` is the token lifetime.
    pub fn set_session(&mut self, token: &str, max_age_secs: i64) {
        let cookie = Cookie::build((SESSION_COOKIE, token.to_string()))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(Duration::seconds(max_age_secs))
            .build();
        self.outgoing.push(cookie);
    }

    /// Write the OAuth state cookie.
    pub fn set_state(&mut self, state: &str) {
        let cookie = Cookie::build((STATE_COOKIE, state.to_string()))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(Duration::seconds(SHORT_COOKIE_MAX_AGE_SECS))
            .build();
        self.outgoing.push(cookie);
    }

    /// Remember where to send the user after login.
    ///
    /// Plain paths are stored as-is; anything outside the cookie-octet set
    /// (or containing `%`) is percent-encoded.
    pub fn set_redirect(&mut self, path: &str) {
        let value = if path.bytes().all(is_plain_cookie_octet) {
            path.to_string()
        } else {
            urlencoding::encode(path).into_owned()
        };
        let cookie = Cookie::build((REDIRECT_COOKIE, value))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(Duration::seconds(SHORT_COOKIE_MAX_AGE_SECS))
            .build();
        self.outgoing.push(cookie);
    }

    fn clear(&mut self, name: &'static str) {
        let cookie = Cookie::build((name, ""))
            .http_only(true)
            .secure(self.secure)
            .path("/")
            .max_age(Duration::seconds(-1))
            .build();
        self.outgoing.push(cookie);
    }

    pub fn clear_session(&mut self) {
        self.clear(SESSION_COOKIE);
    }

    pub fn clear_state(&mut self) {
        self.clear(STATE_COOKIE);
    }

    pub fn clear_redirect(&mut self) {
        self.clear(REDIRECT_COOKIE);
    }

    /// Read and clear the OAuth state.
    pub fn take_state(&mut self) -> Option<String> {
        let state = self.state().map(str::to_string);
        self.clear_state();
        state
    }

    /// Read and clear the post-login redirect.
    pub fn take_redirect(&mut self) -> Option<String> {
        let redirect = self.redirect();
        self.clear_redirect();
        redirect
    }

    /// Whether any `Set-Cookie` header is pending.
    pub fn has_changes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Append the pending `Set-Cookie` headers to `response`.
    pub fn apply(self, response: &mut Response) {
        let headers = response.headers_mut();
        for cookie in self.outgoing {
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(e) => warn!(cookie = %cookie.name(), error = %e, "dropping unencodable cookie"),
            }
        }
    }

    /// Attach the pending cookies to `response` and return it.
    pub fn into_response_with(self, mut response: Response) -> Response {
        self.apply(&mut response);
        response
    }
}
