use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Plain-text body sent with every 429.
pub const RATE_LIMIT_BODY: &str = "Rate limit exceeded. Please try again later.";
/// Prefix of every 403 body produced by CSRF validation.
pub const CSRF_FAILURE_BODY: &str = "CSRF validation failed";

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Why a double-submitted CSRF token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CsrfError {
    #[error("missing cookie")]
    MissingCookie,
    #[error("missing token")]
    MissingToken,
    #[error("token mismatch")]
    Mismatch,
    #[error("unknown token")]
    NotFound,
    #[error("token expired")]
    Expired,
}

/// The entropy source could not produce a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("entropy source failed: {0}")]
pub struct TokenGenerationError(pub String);

/// The identity resolver could not name the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("no identity presented")]
    Absent,
    #[error("malformed identity: {0}")]
    Malformed(String),
    #[error("identity lookup failed: {0}")]
    Lookup(String),
    #[error("identity headers from untrusted peer {0}")]
    UntrustedPeer(String),
}

/// Outcome of a rate-limit check that did not admit the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded")]
    Exceeded,
    #[error("timed out waiting for a rate-limit token")]
    WaitTimeout,
    #[error("wait cancelled")]
    Cancelled,
}

/// The primary error type for the request-defense pipeline.
///
/// Every variant terminates the middleware chain; the HTTP mapping never exposes
/// internal details beyond the failure class.
#[derive(Debug)]
pub enum AppError {
    /// For internal server errors that are not expected to be handled by the client.
    Internal(anyhow::Error),
    /// CSRF token could not be minted.
    TokenGeneration(TokenGenerationError),
    /// Double-submit validation failed.
    Csrf(CsrfError),
    /// The caller's bucket is empty.
    RateLimited {
        /// Configured burst size, echoed in `X-RateLimit-Limit`.
        limit: u32,
        /// Approximate Unix timestamp after which a retry may succeed.
        reset: i64,
    },
    /// The caller waited for a token and gave up.
    WaitTimeout { limit: u32, reset: i64 },
    /// A blocked wait was released because the server is shutting down.
    ShuttingDown,
    /// A handler panicked; the id correlates the response with the log line.
    Panicked { error_id: Uuid },
    /// No caller identity was available where one is required.
    Unauthorized(String),
    /// The caller is known but not allowed.
    Forbidden(String),
    /// For when configuration or user input is invalid.
    InvalidInput(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::TokenGeneration(e) => write!(f, "Token generation failed: {}", e),
            AppError::Csrf(e) => write!(f, "{}: {}", CSRF_FAILURE_BODY, e),
            AppError::RateLimited { limit, .. } => write!(f, "Rate limited (burst {})", limit),
            AppError::WaitTimeout { limit, .. } => {
                write!(f, "Rate limit wait timed out (burst {})", limit)
            }
            AppError::ShuttingDown => write!(f, "Service shutting down"),
            AppError::Panicked { error_id } => write!(f, "Handler panicked (error id {})", error_id),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Internal(e) => Some(e.as_ref()),
            AppError::TokenGeneration(e) => Some(e),
            AppError::Csrf(e) => Some(e),
            _ => None,
        }
    }
}

fn rate_limited_response(limit: u32, reset: i64) -> Response {
    let mut res = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_BODY).into_response();
    let headers = res.headers_mut();
    headers.insert(HeaderName::from_static(RATE_LIMIT_LIMIT_HEADER), HeaderValue::from(limit));
    headers.insert(HeaderName::from_static(RATE_LIMIT_RESET_HEADER), HeaderValue::from(reset));
    res
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(e) => {
                let error_id = Uuid::new_v4();
                tracing::error!(%error_id, "Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal Server Error (error id: {})", error_id),
                )
                    .into_response()
            }
            AppError::TokenGeneration(e) => {
                tracing::error!("CSRF token generation failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
            AppError::Csrf(e) => {
                (StatusCode::FORBIDDEN, format!("{}: {}", CSRF_FAILURE_BODY, e)).into_response()
            }
            AppError::RateLimited { limit, reset } | AppError::WaitTimeout { limit, reset } => {
                rate_limited_response(limit, reset)
            }
            AppError::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service is shutting down").into_response()
            }
            AppError::Panicked { error_id } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal Server Error (error id: {})", error_id),
            )
                .into_response(),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<CsrfError> for AppError {
    fn from(err: CsrfError) -> Self {
        AppError::Csrf(err)
    }
}

impl From<TokenGenerationError> for AppError {
    fn from(err: TokenGenerationError) -> Self {
        AppError::TokenGeneration(err)
    }
}

impl From<globset::Error> for AppError {
    fn from(err: globset::Error) -> Self {
        AppError::InvalidInput(format!("Invalid endpoint pattern: {}", err))
    }
}

/// A type alias for `Result<T, AppError>`, used throughout the application.
pub type AppResult<T> = Result<T, AppError>;
