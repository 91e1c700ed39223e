//! Prometheus metrics collection.
//!
//! Provides request-plane metrics in Prometheus format.

use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for rate limit rejections.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LimiterLabels {
    pub limiter: String,
}

/// Labels for OAuth callback outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OAuthLabels {
    pub outcome: String,
}

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// Requests rejected with 429, by limiter name.
    pub rate_limit_rejections: Family<LimiterLabels, Counter>,

    /// Store failures that were answered by failing open.
    pub rate_limit_store_errors: Counter,

    /// Requests that reached the unauthenticated branch.
    pub auth_failures: Counter,

    /// OAuth callbacks by outcome.
    pub oauth_callbacks: Family<OAuthLabels, Counter>,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let rate_limit_rejections = Family::<LimiterLabels, Counter>::default();
        registry.register(
            "rate_limit_rejections",
            "Requests rejected by a rate limiter",
            rate_limit_rejections.clone(),
        );

        let rate_limit_store_errors = Counter::default();
        registry.register(
            "rate_limit_store_errors",
            "Rate limit store failures answered by failing open",
            rate_limit_store_errors.clone(),
        );

        let auth_failures = Counter::default();
        registry.register(
            "auth_failures",
            "Requests without a usable session",
            auth_failures.clone(),
        );

        let oauth_callbacks = Family::<OAuthLabels, Counter>::default();
        registry.register(
            "oauth_callbacks",
            "OAuth callbacks by outcome",
            oauth_callbacks.clone(),
        );

        Self {
            registry,
            rate_limit_rejections,
            rate_limit_store_errors,
            auth_failures,
            oauth_callbacks,
        }
    }

    /// Record a rate limit rejection.
    pub fn record_rate_limit(&self, limiter: &str) {
        self.rate_limit_rejections
            .get_or_create(&LimiterLabels {
                limiter: limiter.to_string(),
            })
            .inc();
    }

    /// Record a store failure.
    pub fn record_store_error(&self) {
        self.rate_limit_store_errors.inc();
    }

    /// Record an unauthenticated request.
    pub fn record_auth_failure(&self) {
        self.auth_failures.inc();
    }

    /// Record an OAuth callback outcome.
    pub fn record_oauth_callback(&self, outcome: &str) {
        self.oauth_callbacks
            .get_or_create(&OAuthLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible, and all metric
    /// labels use derived `EncodeLabelSet` impls that do not produce
    /// `fmt::Error`.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Prometheus encoding to String buffer is infallible
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
