//! Per-endpoint limit overrides.
//!
//! Patterns are `"<METHOD>:<path>"`. A path ending in `*` matches any
//! request path that starts with the text before the `*`. Exact matches win
//! over wildcards, and among wildcards the longest prefix wins.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;
use parking_lot::RwLock;

use super::rate_limit::{KeyStrategy, LimitFn};

/// Registry of method+path limit overrides.
///
/// Written during setup, read on every request.
#[derive(Debug, Default)]
pub struct EndpointRateLimits {
    limits: RwLock<HashMap<String, u64>>,
}

impl EndpointRateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `limit` for `pattern` (e.g. `"POST:/api/messages/*"`).
    pub fn set(&self, pattern: &str, limit: u64) {
        self.limits.write().insert(pattern.to_string(), limit);
    }

    pub fn len(&self) -> usize {
        self.limits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.read().is_empty()
    }

    /// The override for `method` and `path`, if any pattern matches.
    pub fn lookup(&self, method: &str, path: &str) -> Option<u64> {
        let limits = self.limits.read();

        if let Some(limit) = limits.get(&format!("{method}:{path}")) {
            return Some(*limit);
        }

        limits
            .iter()
            .filter_map(|(pattern, limit)| {
                let (pattern_method, pattern_path) = pattern.split_once(':')?;
                if pattern_method != method {
                    return None;
                }
                let prefix = pattern_path.strip_suffix('*')?;
                path.starts_with(prefix).then_some((prefix.len(), *limit))
            })
            .max_by_key(|(prefix_len, _)| *prefix_len)
            .map(|(_, limit)| limit)
    }

    /// The override for `method` and `path`, or `default`.
    pub fn get(&self, method: &str, path: &str, default: u64) -> u64 {
        self.lookup(method, path).unwrap_or(default)
    }

    /// Limit function for a [`RateLimitConfig`](super::RateLimitConfig).
    pub fn limit_fn(self: &Arc<Self>, default: u64) -> LimitFn {
        let limits = Arc::clone(self);
        Arc::new(move |request: &Request| {
            limits.get(request.method().as_str(), request.uri().path(), default)
        })
    }

    /// Endpoint keying that only applies to requests with an override.
    ///
    /// Requests without a matching pattern are skipped so they are not
    /// double-counted against the general limiter.
    pub fn key_strategy(self: &Arc<Self>) -> KeyStrategy {
        let limits = Arc::clone(self);
        KeyStrategy::custom(move |request: &Request| {
            limits
                .lookup(request.method().as_str(), request.uri().path())
                .and_then(|_| KeyStrategy::ByEndpoint.key(request))
        })
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::body::Body;

    use super::*;

    fn limits() -> EndpointRateLimits {
        let limits = EndpointRateLimits::new();
        limits.set("POST:/api/messages", 10);
        limits.set("POST:/api/*", 50);
        limits.set("POST:/api/messages/*", 20);
        limits.set("GET:/api/search", 5);
        limits
    }

    #[test]
    fn exact_match_wins() {
        assert_eq!(limits().get("POST", "/api/messages", 100), 10);
        assert_eq!(limits().get("GET", "/api/search", 100), 5);
    }

    #[test]
    fn longest_wildcard_prefix_wins() {
        let limits = limits();
        assert_eq!(limits.get("POST", "/api/messages/123", 100), 20);
        assert_eq!(limits.get("POST", "/api/chats", 100), 50);
    }

    #[test]
    fn method_must_match() {
        let limits = limits();
        assert_eq!(limits.get("GET", "/api/messages", 100), 100);
        assert_eq!(limits.get("DELETE", "/api/chats", 100), 100);
        assert_eq!(limits.lookup("get", "/api/search"), None);
    }

    #[test]
    fn unmatched_path_falls_through() {
        assert_eq!(limits().get("POST", "/auth/callback", 7), 7);
    }

    #[test]
    fn bare_star_matches_everything_for_method() {
        let limits = EndpointRateLimits::new();
        limits.set("PUT:*", 3);
        assert_eq!(limits.get("PUT", "/anything/at/all", 100), 3);
    }

    #[test]
    fn limit_fn_and_key_strategy_follow_overrides() {
        let limits = Arc::new(limits());
        let limit_fn = limits.limit_fn(100);
        let key = limits.key_strategy();

        let mut req = Request::builder()
            .method("POST")
            .uri("/api/messages/1")
            .body(Body::empty())
            .unwrap();
        req.headers_mut()
            .insert("x-real-ip", "8.8.8.8".parse().unwrap());
        assert_eq!(limit_fn(&req), 20);
        assert_eq!(key.key(&req).as_deref(), Some("POST:/api/messages/1:8.8.8.8"));

        let other = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        assert_eq!(limit_fn(&other), 100);
        assert_eq!(key.key(&other), None);
    }
}
