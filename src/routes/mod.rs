//! HTTP route table.
//!
//! Every route is served through one of the assembled pipelines:
//!
//! - `health`: liveness and build info, base chain only
//! - `forum`: the pages the defenses protect (public reads, authenticated writes, admin)

pub mod forum;
pub mod health;

use axum::{
    routing::{get_service, post_service},
    Router,
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let p = state.pipelines.clone();

    Router::new()
        .route("/healthz", get_service(p.base.then_handler(health::healthz)))
        .route("/version", get_service(p.base.then_handler(health::version)))
        .route("/", get_service(p.public.then_handler(forum::index)))
        .route(
            "/thread/{id}",
            get_service(p.public.then_handler(forum::view_thread))
                .post_service(p.authenticated.then_handler(forum::reply)),
        )
        .route("/board/{board}/new", post_service(p.authenticated.then_handler(forum::new_thread)))
        .route("/admin", get_service(p.admin.then_handler(forum::admin_home)))
        .route(
            "/admin/metrics",
            get_service(p.admin.then_handler_with_state(forum::admin_metrics, state)),
        )
}
