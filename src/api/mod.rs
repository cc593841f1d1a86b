//! HTTP surface: message intake, listing and answer lookup.

pub mod messages;

use std::sync::Arc;

use axum::{Json, Router, response::IntoResponse, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
}

/// Build the router with all relay endpoints.
pub fn router(store: Arc<dyn Database>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/ping", get(ping))
        .route(
            "/api/messages",
            get(messages::list_messages).post(messages::create_message),
        )
        .route("/api/messages/{id}/answer", get(messages::get_answer))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({ "msg": "pong" }))
}
