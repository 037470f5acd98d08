use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use call_orchestration_cell::router::call_orchestration_routes;
use call_orchestration_cell::services::VideoCallSessionManager;

pub fn create_router(manager: Arc<VideoCallSessionManager>) -> Router {
    Router::new()
        .route("/", get(|| async { "Halcyon Clinic API is running!" }))
        .nest("/video", call_orchestration_routes(manager))
        // Other cells added later
}
