#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! [`TestApp`] drives the REAL router and state. Counters live in an
//! in-memory store on a [`ManualClock`], so window expiry is controlled by
//! the test instead of wall time.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use flowra_kernel::auth::InMemoryUserResolver;
use flowra_kernel::clock::ManualClock;
use flowra_kernel::middleware::AuthConfig;
use flowra_kernel::store::MemoryStore;
use flowra_kernel::{AppState, StateOptions, build_router};

/// Test application wrapper using the REAL kernel routes and state.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub clock: ManualClock,
    pub store: MemoryStore,
}

impl TestApp {
    /// App with mock auth, an in-memory store and default limits.
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    /// App with defaults adjusted by `configure`.
    pub fn with_options(configure: impl FnOnce(&mut StateOptions)) -> Self {
        let clock = ManualClock::new();
        let store = MemoryStore::with_clock(clock.shared());

        let mut options = StateOptions {
            store: Some(Arc::new(store.clone())),
            clock: clock.shared(),
            auth: AuthConfig {
                allow_mock_auth: true,
                resolver: Some(Arc::new(InMemoryUserResolver::new())),
                ..Default::default()
            },
            ..Default::default()
        };
        configure(&mut options);

        let state = AppState::from_options(options).expect("Failed to build app state");
        let router = build_router(state.clone());

        Self {
            router,
            state,
            clock,
            store,
        }
    }

    /// Send a request to the test application.
    pub async fn request(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request")
    }

    /// Send a request with a `Cookie` header.
    pub async fn request_with_cookies(&self, mut request: Request<Body>, cookies: &str) -> Response {
        if !cookies.is_empty() {
            request.headers_mut().insert(
                header::COOKIE,
                cookies.parse().expect("Invalid cookie header"),
            );
        }
        self.request(request).await
    }

    /// GET `uri` with an optional session token.
    pub async fn get(&self, uri: &str, session: Option<&str>) -> Response {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        match session {
            Some(token) => {
                self.request_with_cookies(request, &format!("flowra_session={token}"))
                    .await
            }
            None => self.request(request).await,
        }
    }
}

/// Collect `name=value` pairs from every `Set-Cookie` header.
pub fn extract_cookies(response: &Response) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| {
            // Extract just the cookie name=value, ignoring attributes
            cookie.split(';').next()
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// The full `Set-Cookie` header for `name`, if the response sets it.
pub fn set_cookie(response: &Response, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|cookie| cookie.starts_with(&prefix))
        .map(str::to_string)
}

/// The value a response sets for cookie `name`.
pub fn cookie_value(response: &Response, name: &str) -> Option<String> {
    let cookie = set_cookie(response, name)?;
    let pair = cookie.split(';').next()?;
    pair.split_once('=').map(|(_, v)| v.to_string())
}

/// Whether the response expires cookie `name`.
pub fn clears_cookie(response: &Response, name: &str) -> bool {
    set_cookie(response, name).is_some_and(|c| c.starts_with(&format!("{name}=;")) && c.contains("Max-Age=-1"))
}

/// A response header as a string.
pub fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Read the body as a string.
pub async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Read the body as JSON.
pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
