//! Authentication primitives: claims, validators, and cookies.
//!
//! The request-gating middleware built on these lives in
//! [`crate::middleware::auth`].

pub mod claims;
pub mod cookies;
pub mod validator;

pub use claims::{AuthUser, LegacyUser, TokenClaims};
pub use cookies::{
    CookieJar, REDIRECT_COOKIE, SESSION_COOKIE, STATE_COOKIE, request_is_secure,
};
pub use validator::{
    AuthError, InMemoryUserResolver, JwtTokenValidator, MockTokenValidator, TokenValidator,
    UserResolver,
};
