use crate::handlers::{config, health, history, ws};
use crate::state::AppState;
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/history", get(history::get_history))
        .route("/health", get(health::health))
        .route("/config", get(config::get_config))
        .route("/stream", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
