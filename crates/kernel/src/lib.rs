//! Flowra request-plane kernel.
//!
//! Rate limiting, session authentication and the OAuth login flow that sit
//! in front of every Flowra HTTP handler. The `flowra` binary wires these
//! together; the library exposes them for integration testing.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod pages;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

pub use config::Config;
pub use routes::build_router;
pub use state::{AppState, StateOptions};
