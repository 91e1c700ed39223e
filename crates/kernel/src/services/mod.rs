//! Services that talk to systems outside the request plane.

pub mod oauth;
