#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Rate limiting through real axum routers.
//!
//! Single-limiter routers exercise the fixed-window protocol; the full app
//! covers the endpoint and workspace limiters as they are wired in
//! production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceExt;
use uuid::Uuid;

use flowra_kernel::clock::ManualClock;
use flowra_kernel::metrics::Metrics;
use flowra_kernel::middleware::{
    AuthConfig, AuthMiddleware, KeyStrategy, RateLimitConfig, RateLimiter, rate_limit,
    require_auth,
};
use flowra_kernel::store::{MemoryStore, RateLimitStore, SharedStore, StoreError};

mod common;
use common::{TestApp, body_json, body_string, header_str};

fn limited_router(limiter: RateLimiter) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(|| async { "healthy" }))
        .layer(from_fn_with_state(limiter, rate_limit))
}

fn get_from(uri: &str, ip: &str) -> Request<Body> {
    Request::get(uri)
        .header("x-real-ip", ip)
        .body(Body::empty())
        .unwrap()
}

fn memory_limiter(config: RateLimitConfig, clock: &ManualClock) -> RateLimiter {
    let store: SharedStore = Arc::new(MemoryStore::with_clock(clock.shared()));
    RateLimiter::new(config.with_store(store).with_clock(clock.shared()))
}

struct FailingStore;

#[async_trait]
impl RateLimitStore for FailingStore {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Transport("connection refused".to_string()))
    }

    async fn get_count(&self, _key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Transport("connection refused".to_string()))
    }

    async fn get_ttl(&self, _key: &str) -> Result<Duration, StoreError> {
        Err(StoreError::Transport("connection refused".to_string()))
    }
}

struct HangingStore;

#[async_trait]
impl RateLimitStore for HangingStore {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
        std::future::pending().await
    }

    async fn get_count(&self, _key: &str) -> Result<u64, StoreError> {
        std::future::pending().await
    }

    async fn get_ttl(&self, _key: &str) -> Result<Duration, StoreError> {
        std::future::pending().await
    }
}

// =============================================================================
// Fixed-window protocol
// =============================================================================

#[tokio::test]
async fn burst_then_throttle() {
    let clock = ManualClock::new();
    let limiter = memory_limiter(
        RateLimitConfig::new(3, Duration::from_secs(60)).with_burst(2),
        &clock,
    );
    let app = limited_router(limiter);

    for expected_remaining in ["4", "3", "2", "1", "0"] {
        let response = app.clone().oneshot(get_from("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "x-ratelimit-limit"), Some("5"));
        assert_eq!(
            header_str(&response, "x-ratelimit-remaining"),
            Some(expected_remaining)
        );
        assert!(header_str(&response, "x-ratelimit-reset").is_some());
        assert!(header_str(&response, "retry-after").is_none());
    }

    let response = app.clone().oneshot(get_from("/", "1.2.3.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&response, "x-ratelimit-remaining"), Some("0"));
    let retry_after: u64 = header_str(&response, "retry-after").unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    let body = body_json(response).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["message"], "Rate limit exceeded. Please try again later.");
}

#[tokio::test]
async fn window_expiry_resets_count() {
    let clock = ManualClock::new();
    let limiter = memory_limiter(RateLimitConfig::new(2, Duration::from_secs(60)), &clock);
    let app = limited_router(limiter);

    for _ in 0..2 {
        let response = app.clone().oneshot(get_from("/", "5.5.5.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(get_from("/", "5.5.5.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::from_millis(60_001));

    let response = app.clone().oneshot(get_from("/", "5.5.5.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-ratelimit-remaining"), Some("1"));
}

#[tokio::test]
async fn window_expiry_in_real_time() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::new(
        RateLimitConfig::new(1, Duration::from_millis(50)).with_store(store),
    );
    let app = limited_router(limiter);

    let first = app.clone().oneshot(get_from("/", "6.6.6.6")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.clone().oneshot(get_from("/", "6.6.6.6")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&second, "retry-after"), Some("1"));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let third = app.clone().oneshot(get_from("/", "6.6.6.6")).await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
    assert_eq!(header_str(&third, "x-ratelimit-remaining"), Some("0"));
}

#[tokio::test]
async fn distinct_keys_do_not_share_quota() {
    let clock = ManualClock::new();
    let limiter = memory_limiter(RateLimitConfig::new(1, Duration::from_secs(60)), &clock);
    let app = limited_router(limiter);

    let a = app.clone().oneshot(get_from("/", "10.0.0.1")).await.unwrap();
    assert_eq!(a.status(), StatusCode::OK);
    let a_again = app.clone().oneshot(get_from("/", "10.0.0.1")).await.unwrap();
    assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);

    let b = app.clone().oneshot(get_from("/", "10.0.0.2")).await.unwrap();
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(header_str(&b, "x-ratelimit-remaining"), Some("0"));
}

#[tokio::test]
async fn skip_paths_are_never_limited() {
    let clock = ManualClock::new();
    let limiter = memory_limiter(
        RateLimitConfig::new(1, Duration::from_secs(60)).with_skip_paths(["/health"]),
        &clock,
    );
    let app = limited_router(limiter);

    for _ in 0..10 {
        let response = app.clone().oneshot(get_from("/health", "7.7.7.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header_str(&response, "x-ratelimit-limit").is_none());
        assert!(header_str(&response, "x-ratelimit-remaining").is_none());
    }
}

#[tokio::test]
async fn no_store_is_pass_through() {
    let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
    let app = limited_router(limiter);

    for _ in 0..20 {
        let response = app.clone().oneshot(get_from("/", "8.8.8.8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn store_failure_fails_open() {
    let metrics = Arc::new(Metrics::new());
    let limiter = RateLimiter::with_metrics(
        RateLimitConfig::new(1, Duration::from_secs(60)).with_store(Arc::new(FailingStore)),
        Some(metrics.clone()),
    );
    let app = limited_router(limiter);

    for _ in 0..3 {
        let response = app.clone().oneshot(get_from("/", "9.9.9.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
    assert!(metrics.encode().contains("rate_limit_store_errors_total 3"));
}

#[tokio::test]
async fn slow_store_hits_deadline_and_fails_open() {
    let limiter = RateLimiter::new(
        RateLimitConfig::new(1, Duration::from_secs(60))
            .with_store(Arc::new(HangingStore))
            .with_store_timeout(Duration::from_millis(20)),
    );
    let app = limited_router(limiter);

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        app.oneshot(get_from("/", "9.9.9.8")),
    )
    .await
    .expect("limiter should give up on the store")
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn custom_exceed_handler_and_message() {
    let clock = ManualClock::new();
    let limiter = memory_limiter(
        RateLimitConfig::new(1, Duration::from_secs(60)).with_exceed_handler(|_req, ttl| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "wait_secs": ttl.as_secs() })),
            )
                .into_response()
        }),
        &clock,
    );
    let app = limited_router(limiter);

    app.clone().oneshot(get_from("/", "1.1.1.1")).await.unwrap();
    let response = app.clone().oneshot(get_from("/", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(header_str(&response, "retry-after").is_some());
    assert_eq!(body_json(response).await["wait_secs"], 60);

    let limiter = memory_limiter(
        RateLimitConfig::new(1, Duration::from_secs(60)).with_message("Too many chats"),
        &clock,
    );
    let app = limited_router(limiter);
    app.clone().oneshot(get_from("/", "1.1.1.1")).await.unwrap();
    let response = app.clone().oneshot(get_from("/", "1.1.1.1")).await.unwrap();
    assert_eq!(body_json(response).await["message"], "Too many chats");
}

#[tokio::test]
async fn per_user_isolation() {
    let clock = ManualClock::new();
    let store: SharedStore = Arc::new(MemoryStore::with_clock(clock.shared()));
    let limiter = RateLimiter::new(
        RateLimitConfig::new(2, Duration::from_secs(60))
            .with_key(KeyStrategy::ByUser)
            .with_store(store)
            .with_clock(clock.shared()),
    );
    let auth = AuthMiddleware::new(AuthConfig {
        allow_mock_auth: true,
        ..Default::default()
    });
    let app = Router::new()
        .route("/api/chats", get(|| async { "chats" }))
        .route_layer(from_fn_with_state(limiter, rate_limit))
        .route_layer(from_fn_with_state(auth, require_auth));

    let as_user = |token: &str| {
        Request::get("/api/chats")
            .header("cookie", format!("flowra_session={token}"))
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(as_user("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(as_user("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app.clone().oneshot(as_user("bob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-ratelimit-remaining"), Some("1"));
}

// =============================================================================
// Full application wiring
// =============================================================================

#[tokio::test]
async fn health_is_skipped_by_default_ip_limiter() {
    let app = TestApp::with_options(|o| {
        o.limit = 1;
        o.burst = 0;
    });

    for _ in 0..5 {
        let response = app.get("/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header_str(&response, "x-ratelimit-limit").is_none());
    }

    let body = body_json(app.get("/health", None).await).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn endpoint_override_limits_one_route() {
    let app = TestApp::new();
    app.state.endpoint_limits().set("GET:/login", 2);

    for _ in 0..2 {
        let response = app.get("/login", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.get("/login", None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&response, "x-ratelimit-limit"), Some("2"));

    // Routes without an override only see the per-IP limiter.
    let response = app.get("/metrics", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-ratelimit-limit"), Some("120"));

    let metrics = body_string(app.get("/metrics", None).await).await;
    assert!(metrics.contains(r#"rate_limit_rejections_total{limiter="endpoint"} 1"#));
}

#[tokio::test]
async fn workspace_limit_with_override() {
    let app = TestApp::new();
    let busy = Uuid::now_v7();
    let quiet = Uuid::now_v7();
    app.state.workspace_limiter().set_limit(busy, 1);

    let response = app.get(&format!("/workspaces/{busy}"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["workspace_id"], busy.to_string());

    let response = app.get(&format!("/workspaces/{busy}"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&response, "x-ratelimit-limit"), Some("1"));
    let body = body_json(response).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(
        body["message"],
        "Workspace rate limit exceeded. Please try again later."
    );

    let response = app.get(&format!("/workspaces/{quiet}"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);

    app.state.workspace_limiter().remove_limit(busy);
    let response = app.get(&format!("/workspaces/{busy}"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_workspace_id_is_bad_request() {
    let app = TestApp::new();

    let response = app.get("/workspaces/not-a-uuid", Some("alice")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn memory_store_window_follows_injected_clock() {
    let app = TestApp::with_options(|o| {
        o.limit = 1;
        o.burst = 0;
    });

    assert_eq!(app.get("/metrics", None).await.status(), StatusCode::OK);
    assert_eq!(
        app.get("/metrics", None).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    app.clock.advance(Duration::from_secs(61));
    assert_eq!(app.store.purge_expired(), 1);
    assert_eq!(app.get("/metrics", None).await.status(), StatusCode::OK);
}
