//! # Boardwarden
//!
//! Request-defense core for a forum service. Every HTTP request passes through an
//! ordered middleware pipeline before reaching a handler:
//!
//! - per-caller token-bucket rate limiting, globally and per route pattern
//! - double-submit CSRF protection for state-changing requests
//! - identity gates for authenticated and admin routes
//!
//! ## Architecture
//!
//! - **Axum** / **Tower**: HTTP routing and the middleware stages themselves
//! - **Tokio**: async runtime, locks and the background sweepers
//! - **config** + **dotenvy**: layered TOML/env configuration
//! - **tracing**: structured logs for every rejection
//!
//! ## Core Components
//!
//! - [`chain`]: immutable, ordered middleware composition
//! - [`pipeline`]: defense state and the per-route-class chains built from it
//! - [`middleware`]: the rate limiter, CSRF store and identity stages
//! - [`sweep`]: periodic eviction of idle visitors and expired tokens
//! - [`clock`]: injectable time source
//! - [`config`]: application configuration management
//! - [`error`]: centralized error handling and HTTP error responses
//! - [`metrics`]: counters for defense decisions
//! - [`routes`]: HTTP handlers
//! - [`state`]: shared application state and sweeper lifecycle

pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod sweep;
