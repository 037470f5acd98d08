// libs/call-orchestration-cell/src/router.rs
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::handlers::*;
use crate::services::VideoCallSessionManager;

/// Routes for call orchestration: provider webhook ingestion, session
/// management and the staff control surface.
pub fn call_orchestration_routes(manager: Arc<VideoCallSessionManager>) -> Router {
    Router::new()
        .route("/health", get(call_health_check))
        // Provider event stream
        .route("/webhooks/provider", post(ingest_provider_event))
        // Session lifecycle
        .route("/appointments/{appointment_id}/session", post(create_session_for_appointment))
        .route("/sessions/{session_id}", get(get_call_session))
        .route("/sessions/{session_id}/participants", get(get_call_participants))
        .route("/sessions/{session_id}/end", delete(force_end_call))
        // Recording control
        .route("/sessions/{session_id}/recording/start", post(start_call_recording))
        .route("/sessions/{session_id}/recording/stop", post(stop_call_recording))
        .with_state(manager)
}
