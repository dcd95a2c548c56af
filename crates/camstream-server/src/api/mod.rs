mod signal;
mod stream;

use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_json_body = state.config.max_json_body;

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // WebRTC signaling
        .route(
            "/webrtc",
            post(signal::signal).layer(DefaultBodyLimit::max(max_json_body)),
        )
        // Raw Annex-B stream
        .route("/video.h264", get(stream::video))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
