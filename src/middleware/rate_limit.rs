//! Per-caller token-bucket rate limiting.
//!
//! [`RateLimiter`] keeps one [`TokenBucket`] per caller key (the visitor registry) and
//! offers a non-blocking [`RateLimiter::allow`] and a blocking [`RateLimiter::wait`].
//! [`EndpointRateLimiter`] maps path globs to independent limiters. Idle visitors are
//! reclaimed by a [`Sweeper`](crate::sweep::Sweeper) driving [`VisitorSweep`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
};
use globset::{GlobBuilder, GlobMatcher};
use tokio::{sync::RwLock, time};
use tokio_util::sync::CancellationToken;

use super::ip::CallerKeys;
use crate::chain::Middleware;
use crate::clock::{self, SharedClock};
use crate::config::EndpointLimit;
use crate::error::{AppError, AppResult, RateLimitError};
use crate::metrics::Metrics;
use crate::sweep::Sweepable;

/// Visitors unseen for this long are evicted by the sweep.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60 * 60);
/// How often the visitor sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Continuous-refill bucket holding at most `burst` tokens.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst);
        Self { rate, burst, tokens: burst, last: now }
    }

    fn refill(&mut self, now: Instant) {
        // A clock that moved backwards refills nothing
        if let Some(elapsed) = now.checked_duration_since(self.last) {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
            self.last = now;
        }
    }

    /// Current level without consuming anything.
    pub fn tokens(&self, now: Instant) -> f64 {
        let elapsed = now.checked_duration_since(self.last).unwrap_or_default();
        (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst)
    }

    /// Takes one token if a whole one is available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available, or `None` if the bucket never refills.
    pub fn time_to_next_token(&self, now: Instant) -> Option<Duration> {
        let missing = 1.0 - self.tokens(now);
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(missing / self.rate).ok()
    }
}

#[derive(Debug)]
struct Visitor {
    bucket: TokenBucket,
    last_seen: Instant,
}

type SharedVisitor = Arc<Mutex<Visitor>>;

/// A thread-safe per-key token-bucket limiter.
///
/// The map lock is only taken for writing to insert or evict visitors; each visitor's
/// bucket and `last_seen` sit behind their own mutex, so concurrent requests for
/// different keys only share a read lock.
#[derive(Clone)]
pub struct RateLimiter {
    visitors: Arc<RwLock<HashMap<String, SharedVisitor>>>,
    rate: f64,
    burst: u32,
    idle_ttl: Duration,
    clock: SharedClock,
}

impl RateLimiter {
    /// Creates a new `RateLimiter`.
    ///
    /// # Arguments
    ///
    /// * `rate` - Tokens added per second.
    /// * `burst` - Bucket capacity; a fresh key may make this many requests at once.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_clock(rate, burst, clock::system())
    }

    pub fn with_clock(rate: f64, burst: u32, clock: SharedClock) -> Self {
        Self {
            visitors: Arc::new(RwLock::new(HashMap::new())),
            rate,
            burst,
            idle_ttl: DEFAULT_IDLE_TTL,
            clock,
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    async fn get_or_create(&self, key: &str) -> SharedVisitor {
        if let Some(visitor) = self.visitors.read().await.get(key) {
            return visitor.clone();
        }
        let mut visitors = self.visitors.write().await;
        // Another task may have inserted while we waited for the write lock
        visitors
            .entry(key.to_string())
            .or_insert_with(|| {
                let now = self.clock.now();
                Arc::new(Mutex::new(Visitor { bucket: TokenBucket::new(self.rate, self.burst, now), last_seen: now }))
            })
            .clone()
    }

    /// Consumes one token for `key` if one is available. Never blocks beyond lock
    /// contention.
    pub async fn allow(&self, key: &str) -> bool {
        let visitor = self.get_or_create(key).await;
        let now = self.clock.now();
        let mut v = visitor.lock().unwrap_or_else(|e| e.into_inner());
        v.last_seen = now;
        v.bucket.try_acquire(now)
    }

    /// Blocks until a token for `key` is available.
    ///
    /// Fails with [`RateLimitError::WaitTimeout`] as soon as the next token cannot arrive
    /// within `timeout`, and with [`RateLimitError::Cancelled`] when `cancel` fires.
    pub async fn wait(&self, key: &str, timeout: Duration, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        let deadline = time::Instant::now() + timeout;
        let visitor = self.get_or_create(key).await;
        loop {
            let delay = {
                let now = self.clock.now();
                let mut v = visitor.lock().unwrap_or_else(|e| e.into_inner());
                v.last_seen = now;
                if v.bucket.try_acquire(now) {
                    return Ok(());
                }
                v.bucket.time_to_next_token(now)
            };
            let wake = match delay.and_then(|d| time::Instant::now().checked_add(d)) {
                Some(wake) => wake,
                None => return Err(RateLimitError::WaitTimeout),
            };
            if wake > deadline {
                return Err(RateLimitError::WaitTimeout);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = time::sleep_until(wake) => {}
            }
        }
    }

    /// Removes visitors idle for longer than the idle TTL.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let mut visitors = self.visitors.write().await;
        let before = visitors.len();
        visitors.retain(|_, visitor| {
            let v = visitor.lock().unwrap_or_else(|e| e.into_inner());
            now.checked_duration_since(v.last_seen).map(|idle| idle <= self.idle_ttl).unwrap_or(true)
        });
        before - visitors.len()
    }

    pub async fn visitor_count(&self) -> usize {
        self.visitors.read().await.len()
    }

    fn rejection(&self, err: RateLimitError) -> AppError {
        let limit = self.burst;
        let reset = chrono::Utc::now().timestamp() + 1;
        match err {
            RateLimitError::Exceeded => AppError::RateLimited { limit, reset },
            RateLimitError::WaitTimeout => AppError::WaitTimeout { limit, reset },
            RateLimitError::Cancelled => AppError::ShuttingDown,
        }
    }
}

/// Sweep target covering every limiter the service owns.
#[derive(Clone, Default)]
pub struct VisitorSweep {
    limiters: Vec<RateLimiter>,
}

impl VisitorSweep {
    pub fn new(limiters: impl IntoIterator<Item = RateLimiter>) -> Self {
        Self { limiters: limiters.into_iter().collect() }
    }
}

#[async_trait]
impl Sweepable for VisitorSweep {
    fn name(&self) -> &'static str {
        "visitors"
    }

    async fn sweep(&self) -> usize {
        let mut removed = 0;
        for limiter in &self.limiters {
            removed += limiter.sweep_idle().await;
        }
        removed
    }
}

/// Shared state for the rate-limit middleware.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: RateLimiter,
    pub keys: CallerKeys,
    pub metrics: Metrics,
}

/// Shared state for the blocking rate-limit middleware.
#[derive(Clone)]
pub struct WaitRateLimitState {
    pub limiter: RateLimiter,
    pub keys: CallerKeys,
    pub metrics: Metrics,
    pub timeout: Duration,
    /// Fired on shutdown to release blocked requests.
    pub cancel: CancellationToken,
}

fn reject(limiter: &RateLimiter, metrics: &Metrics, err: RateLimitError, method: &str, path: &str, key: &str) -> Response {
    match err {
        RateLimitError::Exceeded => metrics.inc_rate_limited(),
        RateLimitError::WaitTimeout => {
            metrics.inc_rate_limited();
            metrics.inc_wait_timeouts();
        }
        RateLimitError::Cancelled => {}
    }
    tracing::warn!(%method, %path, caller = %key, "rate limit rejected request: {}", err);
    limiter.rejection(err).into_response()
}

/// Rejects with 429 when the caller's bucket is empty.
pub async fn rate_limit_middleware(State(state): State<RateLimitState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let key = state.keys.key_for(&parts).await;
    if !state.limiter.allow(&key).await {
        return reject(&state.limiter, &state.metrics, RateLimitError::Exceeded, parts.method.as_str(), parts.uri.path(), &key);
    }
    next.run(Request::from_parts(parts, body)).await
}

/// Holds the request until a token is available or the timeout passes. Dropping the
/// request future (client disconnect) abandons the wait.
pub async fn wait_rate_limit_middleware(State(state): State<WaitRateLimitState>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let key = state.keys.key_for(&parts).await;
    if let Err(err) = state.limiter.wait(&key, state.timeout, &state.cancel).await {
        return reject(&state.limiter, &state.metrics, err, parts.method.as_str(), parts.uri.path(), &key);
    }
    next.run(Request::from_parts(parts, body)).await
}

impl RateLimitState {
    pub fn middleware(self) -> Middleware {
        Middleware::layer("rate_limit", from_fn_with_state(self, rate_limit_middleware))
    }
}

impl WaitRateLimitState {
    pub fn middleware(self) -> Middleware {
        Middleware::layer("wait_rate_limit", from_fn_with_state(self, wait_rate_limit_middleware))
    }
}

#[derive(Clone)]
struct Endpoint {
    pattern: String,
    matcher: GlobMatcher,
    limiter: RateLimiter,
}

/// A manager for per-endpoint rate limiters.
///
/// Each registered path glob owns an independent [`RateLimiter`]. When several patterns
/// match a path, the one registered first wins. Paths matching no pattern pass through.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    endpoints: Vec<Endpoint>,
    idle_ttl: Duration,
    clock: SharedClock,
}

impl Default for EndpointRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRateLimiter {
    /// Creates a new, empty `EndpointRateLimiter`.
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self { endpoints: Vec::new(), idle_ttl: DEFAULT_IDLE_TTL, clock }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        for ep in &mut self.endpoints {
            ep.limiter = ep.limiter.clone().with_idle_ttl(idle_ttl);
        }
        self
    }

    /// Registers `pattern` with its own limiter. `*` does not cross `/`.
    ///
    /// Re-registering an existing pattern replaces its limiter but keeps its position.
    pub fn add_endpoint(&mut self, pattern: &str, rate: f64, burst: u32) -> AppResult<()> {
        let matcher = GlobBuilder::new(pattern).literal_separator(true).build()?.compile_matcher();
        let limiter = RateLimiter::with_clock(rate, burst, self.clock.clone()).with_idle_ttl(self.idle_ttl);
        let endpoint = Endpoint { pattern: pattern.to_string(), matcher, limiter };
        match self.endpoints.iter_mut().find(|ep| ep.pattern == pattern) {
            Some(existing) => *existing = endpoint,
            None => self.endpoints.push(endpoint),
        }
        Ok(())
    }

    /// Configures the rate limiter with a set of endpoint-specific limits.
    pub fn with_limits(mut self, limits: &[EndpointLimit]) -> AppResult<Self> {
        for limit in limits {
            self.add_endpoint(&limit.pattern, limit.rate, limit.burst)?;
        }
        Ok(self)
    }

    /// The pattern and limiter governing `path`, if any.
    pub fn limiter_for(&self, path: &str) -> Option<(&str, &RateLimiter)> {
        self.endpoints
            .iter()
            .find(|ep| ep.matcher.is_match(path))
            .map(|ep| (ep.pattern.as_str(), &ep.limiter))
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.endpoints.iter().map(|ep| ep.pattern.as_str()).collect()
    }

    pub fn limiters(&self) -> impl Iterator<Item = &RateLimiter> {
        self.endpoints.iter().map(|ep| &ep.limiter)
    }

    /// Returns the wrapper applying these endpoint limits.
    pub fn middleware(&self, keys: CallerKeys, metrics: Metrics) -> Middleware {
        let state = EndpointLimitState { router: Arc::new(self.clone()), keys, metrics };
        Middleware::layer("endpoint_rate_limit", from_fn_with_state(state, endpoint_rate_limit_middleware))
    }
}

#[derive(Clone)]
pub struct EndpointLimitState {
    router: Arc<EndpointRateLimiter>,
    keys: CallerKeys,
    metrics: Metrics,
}

/// Applies the limiter of the first pattern matching the request path.
pub async fn endpoint_rate_limit_middleware(State(state): State<EndpointLimitState>, req: Request, next: Next) -> Response {
    let Some((pattern, limiter)) = state.router.limiter_for(req.uri().path()) else {
        return next.run(req).await;
    };
    let (parts, body) = req.into_parts();
    let key = state.keys.key_for(&parts).await;
    if !limiter.allow(&key).await {
        tracing::debug!(%pattern, "endpoint limit reached");
        return reject(limiter, &state.metrics, RateLimitError::Exceeded, parts.method.as_str(), parts.uri.path(), &key);
    }
    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[tokio::test]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::with_clock(1.0, 2, ManualClock::new().shared());

        assert!(limiter.allow("ip:127.0.0.1").await);
        assert!(limiter.allow("ip:127.0.0.1").await);
        assert!(!limiter.allow("ip:127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_different_keys() {
        let limiter = RateLimiter::with_clock(1.0, 1, ManualClock::new().shared());

        // Both keys should get their own limit
        assert!(limiter.allow("ip:127.0.0.1").await);
        assert!(limiter.allow("ip:127.0.0.2").await);

        // Both should be rate limited on second request
        assert!(!limiter.allow("ip:127.0.0.1").await);
        assert!(!limiter.allow("ip:127.0.0.2").await);
    }

    #[tokio::test]
    async fn refills_continuously_up_to_burst() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(2.0, 3, clock.shared());
        for _ in 0..3 {
            assert!(limiter.allow("k").await);
        }
        assert!(!limiter.allow("k").await);

        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        // A long pause never banks more than the burst
        clock.advance(Duration::from_secs(3600));
        for _ in 0..3 {
            assert!(limiter.allow("k").await);
        }
        assert!(!limiter.allow("k").await);
    }

    #[test]
    fn bucket_level_stays_within_bounds() {
        let clock = ManualClock::new();
        let mut bucket = TokenBucket::new(1.0, 2, clock.now());
        assert_eq!(bucket.tokens(clock.now()), 2.0);

        assert!(bucket.try_acquire(clock.now()));
        assert!(bucket.try_acquire(clock.now()));
        assert!(!bucket.try_acquire(clock.now()));
        assert!(bucket.tokens(clock.now()) >= 0.0);

        clock.advance(Duration::from_millis(250));
        assert!(!bucket.try_acquire(clock.now()));
        assert_eq!(bucket.time_to_next_token(clock.now()), Some(Duration::from_millis(750)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(bucket.tokens(clock.now()), 2.0);
    }

    #[test]
    fn zero_rate_never_refills() {
        let clock = ManualClock::new();
        let mut bucket = TokenBucket::new(0.0, 1, clock.now());
        assert!(bucket.try_acquire(clock.now()));
        clock.advance(Duration::from_secs(86_400));
        assert!(!bucket.try_acquire(clock.now()));
        assert_eq!(bucket.time_to_next_token(clock.now()), None);
    }

    #[tokio::test]
    async fn idle_visitors_are_evicted() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(0.0, 2, clock.shared());
        assert!(limiter.allow("idle").await);
        assert!(limiter.allow("idle").await);
        assert!(!limiter.allow("idle").await);

        clock.advance(Duration::from_secs(30 * 60));
        assert!(limiter.allow("busy").await);
        assert_eq!(limiter.sweep_idle().await, 0);

        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(limiter.sweep_idle().await, 1);
        assert_eq!(limiter.visitor_count().await, 1);

        // Rate is zero, so only a fresh visitor can have tokens again
        assert!(limiter.allow("idle").await);
        assert!(limiter.allow("idle").await);
    }

    #[tokio::test]
    async fn wait_returns_once_a_token_refills() {
        let limiter = RateLimiter::new(50.0, 1);
        let cancel = CancellationToken::new();
        assert!(limiter.allow("w").await);

        let started = std::time::Instant::now();
        limiter.wait("w", Duration::from_secs(1), &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn wait_times_out_quickly_when_refill_is_slow() {
        let limiter = RateLimiter::new(0.1, 1);
        let cancel = CancellationToken::new();
        assert!(limiter.allow("w").await);

        let started = std::time::Instant::now();
        let result = limiter.wait("w", Duration::from_millis(50), &cancel).await;
        assert_eq!(result, Err(RateLimitError::WaitTimeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn wait_unblocks_on_cancel() {
        let limiter = RateLimiter::new(0.5, 1);
        let cancel = CancellationToken::new();
        assert!(limiter.allow("w").await);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let result = limiter.wait("w", Duration::from_secs(5), &cancel).await;
        assert_eq!(result, Err(RateLimitError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allow_never_overspends() {
        let limiter = RateLimiter::with_clock(0.0, 50, ManualClock::new().shared());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let mut admitted = 0;
                for j in 0..40 {
                    let key = if j % 2 == 0 { "shared".to_string() } else { format!("own-{}", i) };
                    if limiter.allow(&key).await && key == "shared" {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }
        let mut shared_admitted = 0;
        for t in tasks {
            shared_admitted += t.await.unwrap();
        }
        assert_eq!(shared_admitted, 50);
        assert_eq!(limiter.visitor_count().await, 9);
    }

    #[tokio::test]
    async fn endpoint_patterns_use_first_registered_match() {
        let clock = ManualClock::new();
        let mut router = EndpointRateLimiter::with_clock(clock.shared());
        router.add_endpoint("/thread/*", 1.0, 1).unwrap();
        router.add_endpoint("/thread/1", 1.0, 100).unwrap();
        router.add_endpoint("/board/*/new", 1.0, 3).unwrap();

        assert_eq!(router.limiter_for("/thread/1").map(|(p, _)| p), Some("/thread/*"));
        assert_eq!(router.limiter_for("/board/rust/new").map(|(p, _)| p), Some("/board/*/new"));
        // `*` stays within one segment
        assert!(router.limiter_for("/thread/1/reply").is_none());
        assert!(router.limiter_for("/").is_none());
    }

    #[tokio::test]
    async fn endpoints_have_independent_quotas() {
        let mut router = EndpointRateLimiter::with_clock(ManualClock::new().shared());
        router.add_endpoint("/a", 0.0, 1).unwrap();
        router.add_endpoint("/b", 0.0, 1).unwrap();

        let (_, a) = router.limiter_for("/a").unwrap();
        let (_, b) = router.limiter_for("/b").unwrap();
        assert!(a.allow("k").await);
        assert!(!a.allow("k").await);
        assert!(b.allow("k").await);
    }

    #[test]
    fn re_registering_keeps_position() {
        let mut router = EndpointRateLimiter::new();
        router.add_endpoint("/x/*", 1.0, 1).unwrap();
        router.add_endpoint("/y", 1.0, 1).unwrap();
        router.add_endpoint("/x/*", 5.0, 10).unwrap();
        assert_eq!(router.patterns(), vec!["/x/*", "/y"]);
        assert_eq!(router.limiter_for("/x/z").unwrap().1.burst(), 10);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut router = EndpointRateLimiter::new();
        assert!(matches!(router.add_endpoint("/a/[", 1.0, 1), Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn visitor_sweep_covers_all_limiters() {
        let clock = ManualClock::new();
        let global = RateLimiter::with_clock(1.0, 1, clock.shared());
        let mut router = EndpointRateLimiter::with_clock(clock.shared());
        router.add_endpoint("/a", 1.0, 1).unwrap();
        let endpoint = router.limiter_for("/a").unwrap().1.clone();

        global.allow("k").await;
        endpoint.allow("k").await;

        let sweep = VisitorSweep::new(std::iter::once(global.clone()).chain(router.limiters().cloned()));
        clock.advance(DEFAULT_IDLE_TTL + Duration::from_secs(1));
        assert_eq!(sweep.sweep().await, 2);
        assert_eq!(global.visitor_count().await, 0);
        assert_eq!(endpoint.visitor_count().await, 0);
    }
}
