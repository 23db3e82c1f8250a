pub mod error;
pub mod flagged;
pub mod health;
pub mod sessions;
pub mod settings;
pub mod video;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::SharedState;

pub use error::{ApiError, ApiResult};

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        // Sessions
        .route("/session/create", post(sessions::create_session))
        .route("/session/end", post(sessions::end_session))
        .route("/session/:id/frame", post(sessions::submit_frame))
        .route("/session/:id/signal", post(sessions::submit_signal))
        .route("/session/:id/details", get(sessions::session_details))
        .route("/sessions/active", get(sessions::active_sessions))
        .route("/sessions/stats", get(sessions::session_stats))
        // Review
        .route("/flagged/all", get(flagged::list_flagged))
        .route("/video/path", post(video::video_by_path))
        .route("/video/:video_ref", get(video::get_video))
        .route(
            "/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
        // Live updates
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}
