// libs/call-orchestration-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::{
    CallOrchestrationError, CallParticipantsResponse, CreateCallSessionResponse, ForceEndResponse,
    ProviderEvent,
};
use crate::services::VideoCallSessionManager;

fn map_error(e: CallOrchestrationError) -> AppError {
    match e {
        CallOrchestrationError::SessionNotFound => {
            AppError::NotFound("Call session not found".to_string())
        }
        CallOrchestrationError::AppointmentNotFound => {
            AppError::NotFound("Appointment not found".to_string())
        }
        CallOrchestrationError::InvalidSessionState { status } => {
            AppError::BadRequest(format!("Call session not available: {}", status))
        }
        CallOrchestrationError::OngoingCallExists => {
            AppError::Conflict("An ongoing call already exists for this appointment".to_string())
        }
        CallOrchestrationError::ValidationError { message } => AppError::BadRequest(message),
        CallOrchestrationError::ProviderNotConfigured => {
            AppError::Internal("Video provider not configured".to_string())
        }
        CallOrchestrationError::ProviderApiError { message } => AppError::ExternalService(message),
        CallOrchestrationError::DatabaseError { message } => AppError::Database(message),
        CallOrchestrationError::Internal { message } => AppError::Internal(message),
    }
}

// ==============================================================================
// PROVIDER WEBHOOK INGESTION
// ==============================================================================

/// Ingest one provider event. The provider retries on non-2xx, so absorbed
/// events (unknown ref, terminated session) still answer 200.
#[axum::debug_handler]
pub async fn ingest_provider_event(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Json(event): Json<ProviderEvent>,
) -> Result<Json<Value>, AppError> {
    manager
        .handle_provider_event(event)
        .await
        .map_err(map_error)?;

    Ok(Json(json!({ "success": true })))
}

// ==============================================================================
// SESSION MANAGEMENT HANDLERS
// ==============================================================================

/// Create a scheduled call session for an appointment (booking-time entry).
#[axum::debug_handler]
pub async fn create_session_for_appointment(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<CreateCallSessionResponse>, AppError> {
    let session = manager
        .create_session_for_appointment(appointment_id)
        .await
        .map_err(map_error)?;

    Ok(Json(CreateCallSessionResponse {
        success: true,
        session,
        message: "Call session created successfully".to_string(),
    }))
}

#[axum::debug_handler]
pub async fn get_call_session(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let session = manager.get_session(session_id).await.map_err(map_error)?;

    Ok(Json(json!({ "session": session })))
}

#[axum::debug_handler]
pub async fn get_call_participants(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<CallParticipantsResponse>, AppError> {
    // surfaces the same authoritative count the termination policy sees
    manager.get_session(session_id).await.map_err(map_error)?;
    let (participants, active_count) = manager
        .session_participants(session_id)
        .await
        .map_err(map_error)?;

    Ok(Json(CallParticipantsResponse {
        call_id: session_id,
        participants,
        active_count,
    }))
}

/// Staff force-end; treated identically to a termination-policy trigger.
#[axum::debug_handler]
pub async fn force_end_call(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ForceEndResponse>, AppError> {
    let session = manager.force_end(session_id).await.map_err(map_error)?;

    Ok(Json(ForceEndResponse {
        success: true,
        session,
        message: "Call session ended".to_string(),
    }))
}

#[axum::debug_handler]
pub async fn start_call_recording(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    manager.start_recording(session_id).await.map_err(map_error)?;

    Ok(Json(json!({ "success": true, "message": "Recording started" })))
}

#[axum::debug_handler]
pub async fn stop_call_recording(
    State(manager): State<Arc<VideoCallSessionManager>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    manager.stop_recording(session_id).await.map_err(map_error)?;

    Ok(Json(json!({ "success": true, "message": "Recording stopped" })))
}

// ==============================================================================
// SYSTEM HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn call_health_check(
    State(manager): State<Arc<VideoCallSessionManager>>,
) -> Json<Value> {
    let provider_healthy = manager.provider_health().await;

    Json(json!({
        "status": "ok",
        "provider_healthy": provider_healthy
    }))
}
