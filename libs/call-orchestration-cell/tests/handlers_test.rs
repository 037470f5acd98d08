// HTTP-surface tests: webhook ingestion and the staff control endpoints,
// driven through the router with oneshot requests.

mod support;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use call_orchestration_cell::models::{CallStatus, ParticipantRole};
use call_orchestration_cell::router::call_orchestration_routes;

use support::{fixture, joined};

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_check_reports_provider_state() {
    let fx = fixture();
    let app = call_orchestration_routes(fx.manager.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["provider_healthy"], true);
}

#[tokio::test]
async fn webhook_join_event_starts_the_call() {
    let fx = fixture();
    let appointment_id = fx.store.seed_appointment("confirmed").await;
    let session = fx
        .manager
        .create_session_for_appointment(appointment_id)
        .await
        .unwrap();

    let app = call_orchestration_routes(fx.manager.clone());
    let payload = json!({
        "event": "participant-joined",
        "meetingRef": session.meeting_ref,
        "userId": Uuid::new_v4(),
        "role": "doctor",
        "timestamp": Utc::now().to_rfc3339(),
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/provider")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fx.store.status_of(session.id).await, CallStatus::Ongoing);
}

#[tokio::test]
async fn webhook_event_for_unknown_meeting_answers_ok() {
    let fx = fixture();
    let app = call_orchestration_routes(fx.manager.clone());

    let payload = json!({
        "event": "participant-left",
        "meetingRef": "mtg_gone",
        "userId": Uuid::new_v4(),
        "timestamp": Utc::now().to_rfc3339(),
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/provider")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    // absorbed, not an error: the provider must not retry stale events
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn force_end_endpoint_completes_ongoing_call() {
    let fx = fixture();
    let appointment_id = fx.store.seed_appointment("confirmed").await;
    let session = fx
        .manager
        .create_session_for_appointment(appointment_id)
        .await
        .unwrap();
    fx.manager
        .handle_provider_event(joined(&session.meeting_ref, Uuid::new_v4(), ParticipantRole::Doctor))
        .await
        .unwrap();

    let app = call_orchestration_routes(fx.manager.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{}/end", session.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["session"]["status"], "completed");
}

#[tokio::test]
async fn force_end_of_missing_session_is_not_found() {
    let fx = fixture();
    let app = call_orchestration_routes(fx.manager.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{}/end", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn participants_endpoint_reports_active_count() {
    let fx = fixture();
    let appointment_id = fx.store.seed_appointment("confirmed").await;
    let session = fx
        .manager
        .create_session_for_appointment(appointment_id)
        .await
        .unwrap();
    fx.manager
        .handle_provider_event(joined(&session.meeting_ref, Uuid::new_v4(), ParticipantRole::Doctor))
        .await
        .unwrap();
    fx.manager
        .handle_provider_event(joined(&session.meeting_ref, Uuid::new_v4(), ParticipantRole::Patient))
        .await
        .unwrap();

    let app = call_orchestration_routes(fx.manager.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{}/participants", session.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["active_count"], 2);
    assert_eq!(json["participants"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn create_session_endpoint_conflicts_on_second_ongoing() {
    let fx = fixture();
    let appointment_id = fx.store.seed_appointment("confirmed").await;
    let session = fx
        .manager
        .create_session_for_appointment(appointment_id)
        .await
        .unwrap();
    fx.manager
        .handle_provider_event(joined(&session.meeting_ref, Uuid::new_v4(), ParticipantRole::Doctor))
        .await
        .unwrap();

    let app = call_orchestration_routes(fx.manager.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/appointments/{}/session", appointment_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}
