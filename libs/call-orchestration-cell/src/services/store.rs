// libs/call-orchestration-cell/src/services/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{CallOrchestrationError, CallSession, ParticipantRecord};

/// Persistence seam for the orchestration core. Constructed once and injected
/// into every component, so tests can substitute an in-memory double.
///
/// The two compare-and-set writes (`mark_ongoing`, `finalize_call`,
/// `cancel_call`) carry their status precondition into the store; `false`
/// means the precondition no longer held and the caller lost the race.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert_call(&self, call: &CallSession) -> Result<(), CallOrchestrationError>;

    async fn get_call(&self, id: Uuid) -> Result<Option<CallSession>, CallOrchestrationError>;

    async fn find_by_meeting_ref(
        &self,
        meeting_ref: &str,
    ) -> Result<Option<CallSession>, CallOrchestrationError>;

    async fn ongoing_call_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<CallSession>, CallOrchestrationError>;

    async fn calls_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Vec<CallSession>, CallOrchestrationError>;

    /// Non-terminal calls, for reconciliation and the watchdog.
    async fn open_calls(&self) -> Result<Vec<CallSession>, CallOrchestrationError>;

    async fn calls_needing_reconciliation(
        &self,
    ) -> Result<Vec<CallSession>, CallOrchestrationError>;

    /// scheduled -> ongoing, setting `started_at`.
    async fn mark_ongoing(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CallOrchestrationError>;

    /// ongoing -> completed, setting `ended_at`/`duration_minutes` and
    /// releasing the recording flag.
    async fn finalize_call(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        duration_minutes: Option<i64>,
    ) -> Result<bool, CallOrchestrationError>;

    /// scheduled -> cancelled (a call that never saw a join).
    async fn cancel_call(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, CallOrchestrationError>;

    /// Recording flag; only writable while the call is ongoing.
    async fn set_recording(&self, id: Uuid, recording: bool)
        -> Result<(), CallOrchestrationError>;

    async fn set_needs_reconciliation(
        &self,
        id: Uuid,
        flag: bool,
    ) -> Result<(), CallOrchestrationError>;

    async fn insert_span(&self, span: &ParticipantRecord) -> Result<(), CallOrchestrationError>;

    async fn close_span(
        &self,
        span_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError>;

    /// Spans with `left_at` unset, oldest first.
    async fn open_spans(
        &self,
        call_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError>;

    async fn spans_for_call(
        &self,
        call_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError>;

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Value>, CallOrchestrationError>;

    /// Raw `video_calls` rows touched at or after `since`, oldest first.
    async fn calls_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, CallOrchestrationError>;

    /// Raw `appointments` rows touched at or after `since`, oldest first.
    async fn appointments_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, CallOrchestrationError>;
}

/// `CallStore` over the Supabase REST interface.
pub struct SupabaseCallStore {
    supabase: SupabaseClient,
}

impl SupabaseCallStore {
    pub fn new(supabase: SupabaseClient) -> Self {
        Self { supabase }
    }

    fn db_err(e: anyhow::Error) -> CallOrchestrationError {
        CallOrchestrationError::DatabaseError {
            message: e.to_string(),
        }
    }

    async fn fetch_one_call(
        &self,
        path: &str,
    ) -> Result<Option<CallSession>, CallOrchestrationError> {
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, path, None)
            .await
            .map_err(Self::db_err)?;

        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| CallOrchestrationError::DatabaseError {
                    message: format!("Failed to parse call session: {}", e),
                })
            })
            .transpose()
    }

    async fn fetch_calls(&self, path: &str) -> Result<Vec<CallSession>, CallOrchestrationError> {
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, path, None)
            .await
            .map_err(Self::db_err)?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| CallOrchestrationError::DatabaseError {
                    message: format!("Failed to parse call session: {}", e),
                })
            })
            .collect()
    }

    async fn fetch_spans(
        &self,
        path: &str,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError> {
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, path, None)
            .await
            .map_err(Self::db_err)?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| CallOrchestrationError::DatabaseError {
                    message: format!("Failed to parse participant span: {}", e),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CallStore for SupabaseCallStore {
    async fn insert_call(&self, call: &CallSession) -> Result<(), CallOrchestrationError> {
        let body = serde_json::to_value(call).map_err(|e| CallOrchestrationError::Internal {
            message: e.to_string(),
        })?;

        let _: Vec<Value> = self
            .supabase
            .request_with_prefer(Method::POST, "/rest/v1/video_calls", Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(())
    }

    async fn get_call(&self, id: Uuid) -> Result<Option<CallSession>, CallOrchestrationError> {
        self.fetch_one_call(&format!("/rest/v1/video_calls?id=eq.{}", id))
            .await
    }

    async fn find_by_meeting_ref(
        &self,
        meeting_ref: &str,
    ) -> Result<Option<CallSession>, CallOrchestrationError> {
        self.fetch_one_call(&format!(
            "/rest/v1/video_calls?meeting_ref=eq.{}",
            meeting_ref
        ))
        .await
    }

    async fn ongoing_call_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<CallSession>, CallOrchestrationError> {
        self.fetch_one_call(&format!(
            "/rest/v1/video_calls?appointment_id=eq.{}&status=eq.ongoing",
            appointment_id
        ))
        .await
    }

    async fn calls_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Vec<CallSession>, CallOrchestrationError> {
        self.fetch_calls(&format!(
            "/rest/v1/video_calls?appointment_id=eq.{}",
            appointment_id
        ))
        .await
    }

    async fn open_calls(&self) -> Result<Vec<CallSession>, CallOrchestrationError> {
        self.fetch_calls("/rest/v1/video_calls?status=in.(scheduled,ongoing)")
            .await
    }

    async fn calls_needing_reconciliation(
        &self,
    ) -> Result<Vec<CallSession>, CallOrchestrationError> {
        self.fetch_calls("/rest/v1/video_calls?needs_reconciliation=eq.true")
            .await
    }

    async fn mark_ongoing(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CallOrchestrationError> {
        let path = format!("/rest/v1/video_calls?id=eq.{}&status=eq.scheduled", id);
        let body = json!({
            "status": "ongoing",
            "started_at": started_at,
            "updated_at": Utc::now(),
        });

        let rows = self
            .supabase
            .request_with_prefer(Method::PATCH, &path, Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(!rows.is_empty())
    }

    async fn finalize_call(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        duration_minutes: Option<i64>,
    ) -> Result<bool, CallOrchestrationError> {
        let path = format!("/rest/v1/video_calls?id=eq.{}&status=eq.ongoing", id);
        let body = json!({
            "status": "completed",
            "ended_at": ended_at,
            "duration_minutes": duration_minutes,
            "is_recording": false,
            "needs_reconciliation": false,
            "updated_at": Utc::now(),
        });

        let rows = self
            .supabase
            .request_with_prefer(Method::PATCH, &path, Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(!rows.is_empty())
    }

    async fn cancel_call(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, CallOrchestrationError> {
        let path = format!("/rest/v1/video_calls?id=eq.{}&status=eq.scheduled", id);
        let body = json!({
            "status": "cancelled",
            "ended_at": ended_at,
            "updated_at": Utc::now(),
        });

        let rows = self
            .supabase
            .request_with_prefer(Method::PATCH, &path, Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(!rows.is_empty())
    }

    async fn set_recording(
        &self,
        id: Uuid,
        recording: bool,
    ) -> Result<(), CallOrchestrationError> {
        let path = format!("/rest/v1/video_calls?id=eq.{}&status=eq.ongoing", id);
        let body = json!({
            "is_recording": recording,
            "updated_at": Utc::now(),
        });

        let _ = self
            .supabase
            .request_with_prefer(Method::PATCH, &path, Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(())
    }

    async fn set_needs_reconciliation(
        &self,
        id: Uuid,
        flag: bool,
    ) -> Result<(), CallOrchestrationError> {
        let path = format!("/rest/v1/video_calls?id=eq.{}", id);
        let body = json!({
            "needs_reconciliation": flag,
            "updated_at": Utc::now(),
        });

        let _ = self
            .supabase
            .request_with_prefer(Method::PATCH, &path, Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(())
    }

    async fn insert_span(&self, span: &ParticipantRecord) -> Result<(), CallOrchestrationError> {
        let body = serde_json::to_value(span).map_err(|e| CallOrchestrationError::Internal {
            message: e.to_string(),
        })?;

        let _: Vec<Value> = self
            .supabase
            .request_with_prefer(Method::POST, "/rest/v1/video_call_participants", Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(())
    }

    async fn close_span(
        &self,
        span_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError> {
        let path = format!("/rest/v1/video_call_participants?id=eq.{}", span_id);
        let body = json!({ "left_at": left_at });

        let _ = self
            .supabase
            .request_with_prefer(Method::PATCH, &path, Some(body))
            .await
            .map_err(Self::db_err)?;

        Ok(())
    }

    async fn open_spans(
        &self,
        call_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError> {
        self.fetch_spans(&format!(
            "/rest/v1/video_call_participants?call_id=eq.{}&left_at=is.null&order=joined_at.asc",
            call_id
        ))
        .await
    }

    async fn spans_for_call(
        &self,
        call_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError> {
        self.fetch_spans(&format!(
            "/rest/v1/video_call_participants?call_id=eq.{}&order=joined_at.asc",
            call_id
        ))
        .await
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Value>, CallOrchestrationError> {
        let rows: Vec<Value> = self
            .supabase
            .request(
                Method::GET,
                &format!("/rest/v1/appointments?id=eq.{}", id),
                None,
            )
            .await
            .map_err(Self::db_err)?;

        Ok(rows.into_iter().next())
    }

    async fn calls_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, CallOrchestrationError> {
        self.supabase
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/video_calls?updated_at=gte.{}&order=updated_at.asc",
                    since.to_rfc3339()
                ),
                None,
            )
            .await
            .map_err(Self::db_err)
    }

    async fn appointments_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, CallOrchestrationError> {
        self.supabase
            .request(
                Method::GET,
                &format!(
                    "/rest/v1/appointments?updated_at=gte.{}&order=updated_at.asc",
                    since.to_rfc3339()
                ),
                None,
            )
            .await
            .map_err(Self::db_err)
    }
}
