// Shared test doubles for the orchestration integration tests. The store and
// provider are injected interfaces, so tests run against these in-memory
// implementations instead of a live backend.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use call_orchestration_cell::models::{
    CallOrchestrationConfig, CallOrchestrationError, CallSession, CallStatus, ParticipantRecord,
    ParticipantRole, ProviderEvent,
};
use call_orchestration_cell::services::{CallStore, MeetingProvider, VideoCallSessionManager};

// ==============================================================================
// IN-MEMORY CALL STORE
// ==============================================================================

#[derive(Default)]
pub struct InMemoryCallStore {
    pub calls: Mutex<HashMap<Uuid, CallSession>>,
    pub spans: Mutex<Vec<ParticipantRecord>>,
    pub appointments: Mutex<HashMap<Uuid, Value>>,
    /// Remaining finalize writes that fail before one succeeds.
    pub finalize_failures: AtomicU32,
    /// Successful ongoing -> completed transitions.
    pub finalize_transitions: AtomicU32,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_appointment(&self, status: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.appointments.lock().await.insert(
            id,
            json!({
                "id": id,
                "status": status,
                "appointment_date": Utc::now().to_rfc3339(),
                "updated_at": Utc::now().to_rfc3339(),
            }),
        );
        id
    }

    pub async fn seed_call(&self, call: CallSession) -> Uuid {
        let id = call.id;
        self.calls.lock().await.insert(id, call);
        id
    }

    pub async fn status_of(&self, id: Uuid) -> CallStatus {
        self.calls.lock().await.get(&id).expect("call exists").status
    }

    pub async fn call(&self, id: Uuid) -> CallSession {
        self.calls.lock().await.get(&id).expect("call exists").clone()
    }

    pub fn fail_next_finalizes(&self, count: u32) {
        self.finalize_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn insert_call(&self, call: &CallSession) -> Result<(), CallOrchestrationError> {
        self.calls.lock().await.insert(call.id, call.clone());
        Ok(())
    }

    async fn get_call(&self, id: Uuid) -> Result<Option<CallSession>, CallOrchestrationError> {
        Ok(self.calls.lock().await.get(&id).cloned())
    }

    async fn find_by_meeting_ref(
        &self,
        meeting_ref: &str,
    ) -> Result<Option<CallSession>, CallOrchestrationError> {
        Ok(self
            .calls
            .lock()
            .await
            .values()
            .find(|c| c.meeting_ref == meeting_ref)
            .cloned())
    }

    async fn ongoing_call_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<CallSession>, CallOrchestrationError> {
        Ok(self
            .calls
            .lock()
            .await
            .values()
            .find(|c| c.appointment_id == appointment_id && c.status == CallStatus::Ongoing)
            .cloned())
    }

    async fn calls_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Vec<CallSession>, CallOrchestrationError> {
        Ok(self
            .calls
            .lock()
            .await
            .values()
            .filter(|c| c.appointment_id == appointment_id)
            .cloned()
            .collect())
    }

    async fn open_calls(&self) -> Result<Vec<CallSession>, CallOrchestrationError> {
        Ok(self
            .calls
            .lock()
            .await
            .values()
            .filter(|c| !c.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn calls_needing_reconciliation(
        &self,
    ) -> Result<Vec<CallSession>, CallOrchestrationError> {
        Ok(self
            .calls
            .lock()
            .await
            .values()
            .filter(|c| c.needs_reconciliation)
            .cloned()
            .collect())
    }

    async fn mark_ongoing(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CallOrchestrationError> {
        let mut calls = self.calls.lock().await;
        match calls.get_mut(&id) {
            Some(call) if call.status == CallStatus::Scheduled => {
                call.status = CallStatus::Ongoing;
                call.started_at = Some(started_at);
                call.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_call(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        duration_minutes: Option<i64>,
    ) -> Result<bool, CallOrchestrationError> {
        let failures = self.finalize_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.finalize_failures.store(failures - 1, Ordering::SeqCst);
            return Err(CallOrchestrationError::DatabaseError {
                message: "injected finalize failure".to_string(),
            });
        }

        let mut calls = self.calls.lock().await;
        match calls.get_mut(&id) {
            Some(call) if call.status == CallStatus::Ongoing => {
                call.status = CallStatus::Completed;
                call.ended_at = Some(ended_at);
                call.duration_minutes = duration_minutes;
                call.is_recording = false;
                call.needs_reconciliation = false;
                call.updated_at = Utc::now();
                self.finalize_transitions.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_call(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, CallOrchestrationError> {
        let mut calls = self.calls.lock().await;
        match calls.get_mut(&id) {
            Some(call) if call.status == CallStatus::Scheduled => {
                call.status = CallStatus::Cancelled;
                call.ended_at = Some(ended_at);
                call.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_recording(
        &self,
        id: Uuid,
        recording: bool,
    ) -> Result<(), CallOrchestrationError> {
        let mut calls = self.calls.lock().await;
        if let Some(call) = calls.get_mut(&id) {
            if call.status == CallStatus::Ongoing {
                call.is_recording = recording;
                call.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn set_needs_reconciliation(
        &self,
        id: Uuid,
        flag: bool,
    ) -> Result<(), CallOrchestrationError> {
        let mut calls = self.calls.lock().await;
        if let Some(call) = calls.get_mut(&id) {
            call.needs_reconciliation = flag;
            call.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_span(&self, span: &ParticipantRecord) -> Result<(), CallOrchestrationError> {
        self.spans.lock().await.push(span.clone());
        Ok(())
    }

    async fn close_span(
        &self,
        span_id: Uuid,
        left_at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError> {
        let mut spans = self.spans.lock().await;
        if let Some(span) = spans.iter_mut().find(|s| s.id == span_id) {
            if span.left_at.is_none() {
                span.left_at = Some(left_at);
            }
        }
        Ok(())
    }

    async fn open_spans(
        &self,
        call_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError> {
        Ok(self
            .spans
            .lock()
            .await
            .iter()
            .filter(|s| s.call_id == call_id && s.left_at.is_none())
            .cloned()
            .collect())
    }

    async fn spans_for_call(
        &self,
        call_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, CallOrchestrationError> {
        Ok(self
            .spans
            .lock()
            .await
            .iter()
            .filter(|s| s.call_id == call_id)
            .cloned()
            .collect())
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Value>, CallOrchestrationError> {
        Ok(self.appointments.lock().await.get(&id).cloned())
    }

    async fn calls_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, CallOrchestrationError> {
        let mut rows: Vec<(DateTime<Utc>, Value)> = self
            .calls
            .lock()
            .await
            .values()
            .filter(|c| c.updated_at >= since)
            .map(|c| (c.updated_at, serde_json::to_value(c).unwrap()))
            .collect();
        rows.sort_by_key(|(t, _)| *t);
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }

    async fn appointments_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, CallOrchestrationError> {
        let rows = self
            .appointments
            .lock()
            .await
            .values()
            .filter(|a| {
                a["updated_at"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc) >= since)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(rows)
    }
}

// ==============================================================================
// MOCK MEETING PROVIDER
// ==============================================================================

#[derive(Default)]
pub struct MockMeetingProvider {
    pub meetings_created: AtomicU32,
    pub recordings_started: AtomicU32,
    pub recordings_stopped: AtomicU32,
    pub meetings_ended: AtomicU32,
    /// When nonzero, that many recording starts fail before one succeeds.
    pub recording_start_failures: AtomicU32,
}

impl MockMeetingProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeetingProvider for MockMeetingProvider {
    async fn create_meeting(&self) -> Result<String, CallOrchestrationError> {
        let n = self.meetings_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mtg_{:04}", n))
    }

    async fn end_meeting(&self, _meeting_ref: &str) -> Result<(), CallOrchestrationError> {
        self.meetings_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_recording(&self, _meeting_ref: &str) -> Result<(), CallOrchestrationError> {
        let failures = self.recording_start_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.recording_start_failures.store(failures - 1, Ordering::SeqCst);
            return Err(CallOrchestrationError::ProviderApiError {
                message: "injected recording failure".to_string(),
            });
        }
        self.recordings_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_recording(&self, _meeting_ref: &str) -> Result<(), CallOrchestrationError> {
        self.recordings_stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, CallOrchestrationError> {
        Ok(true)
    }
}

// ==============================================================================
// FIXTURE WIRING
// ==============================================================================

/// Timers shrunk so grace-period behavior is observable in a test run.
pub fn test_config() -> CallOrchestrationConfig {
    CallOrchestrationConfig {
        grace_period: Duration::from_millis(50),
        watchdog_ceiling: Duration::from_secs(60),
        watchdog_interval: Duration::from_secs(3600),
        feed_poll_interval: Duration::from_millis(20),
        feed_overlap: Duration::from_millis(10),
        finalize_retry_attempts: 3,
        finalize_retry_backoff: Duration::from_millis(5),
    }
}

pub struct Fixture {
    pub store: Arc<InMemoryCallStore>,
    pub provider: Arc<MockMeetingProvider>,
    pub manager: Arc<VideoCallSessionManager>,
}

pub fn fixture() -> Fixture {
    fixture_with_config(test_config())
}

pub fn fixture_with_config(config: CallOrchestrationConfig) -> Fixture {
    let store = Arc::new(InMemoryCallStore::new());
    let provider = Arc::new(MockMeetingProvider::new());
    let manager = VideoCallSessionManager::new(
        store.clone(),
        Some(provider.clone() as Arc<dyn MeetingProvider>),
        config,
    );
    Fixture {
        store,
        provider,
        manager,
    }
}

// Event constructors

pub fn joined(meeting_ref: &str, user_id: Uuid, role: ParticipantRole) -> ProviderEvent {
    ProviderEvent::Joined {
        meeting_ref: meeting_ref.to_string(),
        user_id,
        role,
        at: Utc::now(),
    }
}

pub fn left(meeting_ref: &str, user_id: Uuid) -> ProviderEvent {
    ProviderEvent::Left {
        meeting_ref: meeting_ref.to_string(),
        user_id,
        at: Utc::now(),
    }
}
