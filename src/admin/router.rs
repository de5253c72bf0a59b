//! Axum router construction.

use axum::routing::{get, post};
use axum::Router;

use crate::admin::handlers;
use crate::context::WatchContext;

/// Build the admin router.
pub fn build_router(ctx: WatchContext) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/commands", post(handlers::command_handler))
        .route("/events", post(handlers::events_handler))
        .route("/history/:member_id", get(handlers::history_handler))
        .with_state(ctx)
}
