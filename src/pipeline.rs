//! Route-group pipelines.
//!
//! [`Defenses`] owns every piece of shared defense state as explicit instances.
//! [`Pipelines::assemble`] layers the defense stages into one chain per route class:
//!
//! ```text
//! base          = recover, request_context, trace
//! public        = base + identity + defenses
//! authenticated = base + identity + require_identity + defenses
//! admin         = base + identity + require_identity + require_admin + defenses
//! defenses      = [wait_]rate_limit, endpoint_rate_limit, csrf
//! ```
//!
//! Recovery is outermost so it also covers panics raised inside other stages.

use std::{sync::Arc, time::Duration};

use axum::middleware::{from_fn, from_fn_with_state};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::chain::{Chain, Middleware};
use crate::clock::SharedClock;
use crate::config::{self, AppConfig};
use crate::error::{AppError, AppResult};
use crate::metrics::Metrics;
use crate::middleware::{
    context::{recover_middleware, request_context_middleware},
    csrf::{CsrfState, CsrfStore},
    identity::{
        identity_middleware, require_admin_middleware, require_identity_middleware, AdminList, HeaderIdentityResolver,
        IdentityResolver,
    },
    ip::CallerKeys,
    rate_limit::{EndpointRateLimiter, RateLimitState, RateLimiter, VisitorSweep, WaitRateLimitState},
};

/// Shared, explicitly owned defense state.
#[derive(Clone)]
pub struct Defenses {
    /// Limiter applied to every route group, if enabled.
    pub global: Option<RateLimiter>,
    pub endpoints: EndpointRateLimiter,
    pub csrf: CsrfStore,
    pub keys: CallerKeys,
    pub identity: Arc<dyn IdentityResolver>,
    pub admins: AdminList,
    pub metrics: Metrics,
    /// `Some` switches the global limiter to blocking mode.
    pub wait_timeout: Option<Duration>,
    /// Cancelled on shutdown; releases blocked waiters and stops sweepers.
    pub shutdown: CancellationToken,
}

impl Defenses {
    /// Builds the defenses from `cfg`, rejecting values that would make every request
    /// fail (zero burst, zero TTLs, bad patterns) even when `cfg` was built in code.
    pub fn from_config(cfg: &AppConfig, clock: SharedClock, metrics: Metrics) -> AppResult<Self> {
        config::validate(cfg).map_err(|e| AppError::InvalidInput(e.to_string()))?;
        let rl = &cfg.rate_limit;
        let identity: Arc<dyn IdentityResolver> = Arc::new(
            HeaderIdentityResolver::new(
                &cfg.identity.login_header,
                Some(cfg.identity.name_header.as_str()).filter(|h| !h.trim().is_empty()),
            )?
            .with_trusted_peers(cfg.identity.trusted_proxies.iter().copied()),
        );
        let global = rl
            .enabled
            .then(|| RateLimiter::with_clock(rl.rate, rl.burst, clock.clone()).with_idle_ttl(rl.idle_ttl()));
        let endpoints = if rl.enabled {
            EndpointRateLimiter::with_clock(clock.clone())
                .with_idle_ttl(rl.idle_ttl())
                .with_limits(&cfg.endpoints)?
        } else {
            EndpointRateLimiter::with_clock(clock.clone())
        };

        Ok(Self {
            global,
            endpoints,
            csrf: CsrfStore::new(cfg.csrf.token_ttl()).with_clock(clock),
            keys: CallerKeys::new(rl.trust_proxy_headers).with_resolver(identity.clone()),
            identity,
            admins: AdminList::new(cfg.identity.admins.iter().cloned()),
            metrics,
            wait_timeout: rl.wait_timeout(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Sweep target for every limiter owned here.
    pub fn visitor_sweep(&self) -> VisitorSweep {
        VisitorSweep::new(self.global.iter().cloned().chain(self.endpoints.limiters().cloned()))
    }

    pub async fn active_visitors(&self) -> usize {
        let mut total = 0;
        for limiter in self.global.iter().chain(self.endpoints.limiters()) {
            total += limiter.visitor_count().await;
        }
        total
    }

    fn rate_limit_stage(&self) -> Option<Middleware> {
        let limiter = self.global.clone()?;
        let stage = match self.wait_timeout {
            Some(timeout) => WaitRateLimitState {
                limiter,
                keys: self.keys.clone(),
                metrics: self.metrics.clone(),
                timeout,
                cancel: self.shutdown.clone(),
            }
            .middleware(),
            None => RateLimitState { limiter, keys: self.keys.clone(), metrics: self.metrics.clone() }.middleware(),
        };
        Some(stage)
    }

    /// Rate limiting then CSRF, shared by every route class.
    fn defense_stages(&self) -> Vec<Middleware> {
        let mut stages: Vec<Middleware> = self.rate_limit_stage().into_iter().collect();
        stages.push(self.endpoints.middleware(self.keys.clone(), self.metrics.clone()));
        stages.push(CsrfState { store: self.csrf.clone(), metrics: self.metrics.clone() }.middleware());
        stages
    }
}

/// One chain per route class, built once and read-only afterwards.
#[derive(Clone, Debug)]
pub struct Pipelines {
    pub base: Chain,
    pub public: Chain,
    pub authenticated: Chain,
    pub admin: Chain,
}

impl Pipelines {
    pub fn assemble(defenses: &Defenses) -> Self {
        let base = Chain::new([
            Middleware::layer("recover", from_fn_with_state(defenses.metrics.clone(), recover_middleware)),
            Middleware::layer("request_context", from_fn(request_context_middleware)),
            Middleware::layer("trace", TraceLayer::new_for_http()),
        ]);
        let identified = base.append([Middleware::layer(
            "identity",
            from_fn_with_state(defenses.identity.clone(), identity_middleware),
        )]);
        let require_identity = Middleware::layer("require_identity", from_fn(require_identity_middleware));
        let require_admin =
            Middleware::layer("require_admin", from_fn_with_state(defenses.admins.clone(), require_admin_middleware));

        let public = identified.append(defenses.defense_stages());
        let authenticated = identified.append([require_identity.clone()]).append(defenses.defense_stages());
        let admin = identified.append([require_identity, require_admin]).append(defenses.defense_stages());

        Self { base, public, authenticated, admin }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn stage_order_per_route_class() {
        let defenses = Defenses::from_config(&AppConfig::default(), ManualClock::new().shared(), Metrics::new()).unwrap();
        let p = Pipelines::assemble(&defenses);

        assert_eq!(p.base.names(), vec!["recover", "request_context", "trace"]);
        assert_eq!(
            p.public.names(),
            vec!["recover", "request_context", "trace", "identity", "rate_limit", "endpoint_rate_limit", "csrf"]
        );
        assert_eq!(
            p.authenticated.names(),
            vec![
                "recover",
                "request_context",
                "trace",
                "identity",
                "require_identity",
                "rate_limit",
                "endpoint_rate_limit",
                "csrf"
            ]
        );
        assert_eq!(p.admin.names()[4..6], ["require_identity", "require_admin"]);
    }

    #[test]
    fn wait_mode_and_disabled_limits() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit.wait_timeout_ms = 50;
        let defenses = Defenses::from_config(&cfg, ManualClock::new().shared(), Metrics::new()).unwrap();
        assert!(Pipelines::assemble(&defenses).public.names().contains(&"wait_rate_limit"));

        cfg.rate_limit.enabled = false;
        let defenses = Defenses::from_config(&cfg, ManualClock::new().shared(), Metrics::new()).unwrap();
        let names = Pipelines::assemble(&defenses).public.names();
        assert!(!names.contains(&"rate_limit"));
        assert!(!names.contains(&"wait_rate_limit"));
        assert!(defenses.endpoints.patterns().is_empty());
    }

    #[test]
    fn unusable_settings_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit.burst = 0;
        let err = Defenses::from_config(&cfg, ManualClock::new().shared(), Metrics::new()).err().unwrap();
        assert!(matches!(err, AppError::InvalidInput(ref msg) if msg.contains("burst")));

        let mut cfg = AppConfig::default();
        cfg.csrf.token_ttl_secs = 0;
        assert!(Defenses::from_config(&cfg, ManualClock::new().shared(), Metrics::new()).is_err());
    }
}
