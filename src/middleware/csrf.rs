//! Cross-Site Request Forgery (CSRF) protection middleware.
//!
//! Implements the double-submit cookie pattern. Safe requests (GET, HEAD, OPTIONS) get a
//! freshly minted token, delivered as an `HttpOnly` cookie, in the `X-CSRF-Token`
//! response header and as a [`CsrfToken`] request extension for form rendering.
//! Every other method must present the same token in the cookie and in the header (or
//! the `csrf_token` form field), and the token must still be live in the [`CsrfStore`].
//!
//! Tokens are reusable until they expire; they are not consumed by validation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    extract::{FromRequestParts, Request, State},
    http::{
        header::{CONTENT_TYPE, COOKIE, SET_COOKIE},
        request::Parts,
        HeaderMap, HeaderName, HeaderValue, Method,
    },
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use tokio::sync::RwLock;

use super::ip::remote_addr;
use crate::chain::Middleware;
use crate::clock::{self, SharedClock};
use crate::error::{AppError, CsrfError, TokenGenerationError};
use crate::metrics::Metrics;
use crate::sweep::Sweepable;

pub const CSRF_COOKIE: &str = "csrf_token";
/// Canonical spelling is `X-CSRF-Token`; header names are matched case-insensitively.
pub const CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");
pub const CSRF_FORM_FIELD: &str = "csrf_token";

/// Lifetime of an issued token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// How often expired tokens are purged.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Raw entropy per token before encoding.
pub const TOKEN_BYTES: usize = 32;
/// Largest form body buffered when looking for the form-field fallback.
const MAX_FORM_BYTES: usize = 1024 * 1024;

/// Source of fresh tokens.
pub trait TokenGenerator: Send + Sync + 'static {
    fn generate(&self) -> Result<String, TokenGenerationError>;
}

/// 32 bytes from the operating system CSPRNG, URL-safe base64 without padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRngTokenGenerator;

impl TokenGenerator for OsRngTokenGenerator {
    fn generate(&self) -> Result<String, TokenGenerationError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| TokenGenerationError(e.to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }
}

/// A freshly issued token and the `Set-Cookie` value that carries it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub cookie: String,
    pub expires_at: Instant,
}

/// Live tokens and their expiry instants.
#[derive(Clone)]
pub struct CsrfStore {
    tokens: Arc<RwLock<HashMap<String, Instant>>>,
    ttl: Duration,
    clock: SharedClock,
    generator: Arc<dyn TokenGenerator>,
}

impl Default for CsrfStore {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl CsrfStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            clock: clock::system(),
            generator: Arc::new(OsRngTokenGenerator),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn generate_token(&self) -> Result<String, TokenGenerationError> {
        self.generator.generate()
    }

    /// Mints a token, records it and builds its cookie. `secure` adds the `Secure`
    /// attribute.
    pub async fn issue(&self, secure: bool) -> Result<IssuedToken, TokenGenerationError> {
        let token = self.generate_token()?;
        let expires_at = self.clock.now() + self.ttl;
        self.tokens.write().await.insert(token.clone(), expires_at);
        let cookie = build_cookie(&token, self.ttl, secure);
        Ok(IssuedToken { token, cookie, expires_at })
    }

    /// Checks a double-submitted token.
    ///
    /// `form_token` is only consulted when the header is absent or empty.
    pub async fn validate(&self, headers: &HeaderMap, form_token: Option<&str>) -> Result<(), CsrfError> {
        let cookie = read_cookie(headers, CSRF_COOKIE)
            .filter(|v| !v.is_empty())
            .ok_or(CsrfError::MissingCookie)?;
        let submitted = headers
            .get(&CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| form_token.map(str::trim).filter(|v| !v.is_empty()))
            .ok_or(CsrfError::MissingToken)?;
        if !constant_time_eq(cookie.as_bytes(), submitted.as_bytes()) {
            return Err(CsrfError::Mismatch);
        }

        let now = self.clock.now();
        let expires_at = self.tokens.read().await.get(submitted).copied().ok_or(CsrfError::NotFound)?;
        if now > expires_at {
            let mut tokens = self.tokens.write().await;
            if tokens.get(submitted).is_some_and(|exp| now > *exp) {
                tokens.remove(submitted);
            }
            return Err(CsrfError::Expired);
        }
        Ok(())
    }

    /// Forgets `token` immediately. Returns whether it was present.
    pub async fn invalidate(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token).is_some()
    }

    pub async fn clear(&self) {
        self.tokens.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }

    /// Removes every expired token.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, expires_at| now <= *expires_at);
        before - tokens.len()
    }
}

#[async_trait]
impl Sweepable for CsrfStore {
    fn name(&self) -> &'static str {
        "csrf_tokens"
    }

    async fn sweep(&self) -> usize {
        self.sweep_expired().await
    }
}

fn build_cookie(token: &str, ttl: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
        CSRF_COOKIE,
        token,
        ttl.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Value of the first cookie named `name` across all `Cookie` headers.
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"'))
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Whether the request arrived over TLS, directly or via a terminating proxy.
pub fn is_secure_request(parts: &Parts) -> bool {
    if parts.uri.scheme_str() == Some("https") {
        return true;
    }
    parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or("").trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// The token issued for the current request, for embedding in forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(pub String);

impl<S> FromRequestParts<S> for CsrfToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CsrfToken>()
            .cloned()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("no CSRF token issued for this request")))
    }
}

/// Shared state for the CSRF middleware.
#[derive(Clone)]
pub struct CsrfState {
    pub store: CsrfStore,
    pub metrics: Metrics,
}

impl CsrfState {
    pub fn middleware(self) -> Middleware {
        Middleware::layer("csrf", from_fn_with_state(self, csrf_middleware))
    }
}

fn is_form(parts: &Parts) -> bool {
    parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Buffers a urlencoded body to find the form-field token, then restores the body.
///
/// A body that is too large or cannot be read carries no usable token.
async fn extract_form_token(parts: &Parts, body: Body) -> Result<(Body, Option<String>), CsrfError> {
    let has_header = parts
        .headers
        .get(&CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty());
    if has_header || !is_form(parts) {
        return Ok((body, None));
    }
    let bytes = body::to_bytes(body, MAX_FORM_BYTES)
        .await
        .map_err(|_| CsrfError::MissingToken)?;
    let token = url::form_urlencoded::parse(&bytes)
        .find(|(k, _)| k == CSRF_FORM_FIELD)
        .map(|(_, v)| v.into_owned());
    Ok((Body::from(bytes), token))
}

/// CSRF protection middleware.
///
/// Safe methods: mint a token, attach it to the request, set cookie and header on the
/// response. Unsafe methods: validate, and respond 403 without calling the handler on
/// failure. Token minting failure responds 500.
pub async fn csrf_middleware(State(state): State<CsrfState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();

    if is_safe_method(&parts.method) {
        let issued = match state.store.issue(is_secure_request(&parts)).await {
            Ok(issued) => issued,
            Err(e) => {
                tracing::error!(method = %parts.method, path = %parts.uri.path(), "failed to issue CSRF token: {}", e);
                return AppError::from(e).into_response();
            }
        };
        state.metrics.inc_tokens_issued();
        parts.extensions.insert(CsrfToken(issued.token.clone()));

        let mut res = next.run(Request::from_parts(parts, body)).await;
        match (HeaderValue::from_str(&issued.cookie), HeaderValue::from_str(&issued.token)) {
            (Ok(cookie), Ok(token)) => {
                res.headers_mut().append(SET_COOKIE, cookie);
                res.headers_mut().insert(CSRF_HEADER, token);
            }
            _ => tracing::error!("issued CSRF token is not a valid header value"),
        }
        return res;
    }

    let checked = match extract_form_token(&parts, body).await {
        Ok((body, form_token)) => state
            .store
            .validate(&parts.headers, form_token.as_deref())
            .await
            .map(|()| body),
        Err(e) => Err(e),
    };
    let body = match checked {
        Ok(body) => body,
        Err(e) => {
            state.metrics.inc_csrf_failures();
            tracing::warn!(
                method = %parts.method,
                path = %parts.uri.path(),
                remote = ?remote_addr(&parts),
                reason = %e,
                "CSRF validation failed"
            );
            return AppError::Csrf(e).into_response();
        }
    };
    next.run(Request::from_parts(parts, body)).await
}
