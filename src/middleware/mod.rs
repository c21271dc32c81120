//! Request defenses.
//!
//! Each stage is an axum `from_fn` middleware over explicit shared state, wrapped as a
//! [`crate::chain::Middleware`] so it can be placed in a pipeline:
//!
//! - `context`: request ids, tracing span, panic recovery
//! - `identity`: caller identity and the authenticated/admin gates
//! - `ip`: rate-limit key derivation
//! - `rate_limit`: per-caller token buckets, global and per endpoint
//! - `csrf`: double-submit token issuance and validation

pub mod context;
pub mod csrf;
pub mod identity;
pub mod ip;
pub mod rate_limit;

pub use csrf::{CsrfStore, CsrfToken};
pub use identity::{Identity, IdentityResolver};
pub use rate_limit::{EndpointRateLimiter, RateLimiter};
