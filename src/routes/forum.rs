use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Serialize;

use crate::middleware::{csrf::CsrfToken, identity::Identity};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PageView {
    pub csrf_token: String,
    pub login: Option<String>,
    pub thread: Option<u64>,
}

// Landing page: exposes the freshly issued token for embedding in forms
pub async fn index(CsrfToken(token): CsrfToken, identity: Option<Extension<Identity>>) -> impl IntoResponse {
    Json(PageView { csrf_token: token, login: identity.map(|Extension(id)| id.login), thread: None })
}

pub async fn view_thread(
    Path(id): Path<u64>,
    CsrfToken(token): CsrfToken,
    identity: Option<Extension<Identity>>,
) -> impl IntoResponse {
    Json(PageView { csrf_token: token, login: identity.map(|Extension(id)| id.login), thread: Some(id) })
}

pub async fn reply(Path(id): Path<u64>, identity: Identity) -> impl IntoResponse {
    tracing::info!(thread = id, login = %identity.login, "reply posted");
    (StatusCode::OK, format!("reply posted to thread {}", id))
}

pub async fn new_thread(Path(board): Path<String>, identity: Identity) -> impl IntoResponse {
    tracing::info!(%board, login = %identity.login, "thread created");
    (StatusCode::CREATED, format!("thread created on board {}", board))
}

pub async fn admin_home(identity: Identity) -> impl IntoResponse {
    (StatusCode::OK, format!("welcome, {}", identity.display_name.as_deref().unwrap_or(&identity.login)))
}

// Metrics endpoint: returns JSON snapshot
pub async fn admin_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let visitors = state.defenses.active_visitors().await;
    let tokens = state.defenses.csrf.len().await;
    Json(state.metrics.get_snapshot(visitors, tokens))
}
