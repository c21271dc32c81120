//! Request context and failure containment.
//!
//! [`request_context_middleware`] tags every request with a [`RequestId`] and runs the
//! rest of the pipeline inside a tracing span carrying it. [`recover_middleware`]
//! converts handler panics into a 500 so a panicking handler never takes down the
//! connection task; it must be the outermost stage.

use std::{any::Any, panic::AssertUnwindSafe};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::Metrics;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestId>()
            .copied()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("request context stage missing")))
    }
}

pub async fn request_context_middleware(mut req: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    req.extensions_mut().insert(RequestId(id));
    let span = tracing::info_span!("request", request_id = %id, method = %req.method(), path = %req.uri().path());

    let mut res = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        res.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    res
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Catches panics from everything it wraps and answers 500 with a correlation id.
pub async fn recover_middleware(State(metrics): State<Metrics>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => {
            let error_id = Uuid::new_v4();
            metrics.inc_panics_recovered();
            tracing::error!(%error_id, %method, %path, "handler panicked: {}", panic_message(payload.as_ref()));
            AppError::Panicked { error_id }.into_response()
        }
    }
}
