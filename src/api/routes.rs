//! API route configuration.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::state::AppState;

/// Create the router with all routes.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::hello))
        .nest("/api/v1", v1_routes())
        .with_state(state)
}

fn v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/run", post(handlers::run))
        .route("/play", post(handlers::play))
        .route("/transform", post(handlers::transform))
        .route("/ping", post(handlers::ping))
}
