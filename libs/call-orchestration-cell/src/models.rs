// libs/call-orchestration-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ==============================================================================
// CALL SESSION DOMAIN MODELS
// ==============================================================================

/// One video consultation instance, owned by an appointment.
/// The session manager is the sole writer of `status` and `duration_minutes`;
/// the backing `video_calls` row is the durable source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: Uuid,
    pub appointment_id: Uuid,

    pub status: CallStatus,

    /// Opaque meeting identifier issued by the video provider.
    pub meeting_ref: String,

    /// Appointment slot this call was created for; the watchdog uses it to
    /// expire calls that never saw a join.
    pub scheduled_for: Option<DateTime<Utc>>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Whole minutes between `started_at` and `ended_at`; set only when
    /// `ended_at` is set.
    pub duration_minutes: Option<i64>,

    /// Mutable only while the call is ongoing, and only after provider
    /// confirmation.
    pub is_recording: bool,

    /// Set when a terminal persistence failure left the durable row behind
    /// the local decision; cleared by the sync bridge reconciliation pass.
    #[serde(default)]
    pub needs_reconciliation: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        appointment_id: Uuid,
        meeting_ref: String,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            appointment_id,
            status: CallStatus::Scheduled,
            meeting_ref,
            scheduled_for,
            started_at: None,
            ended_at: None,
            duration_minutes: None,
            is_recording: false,
            needs_reconciliation: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallStatus {
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "ongoing")]
    Ongoing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl CallStatus {
    /// Terminal sessions ignore further provider events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Scheduled => "scheduled",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Completed => "completed",
            CallStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One continuous presence interval of a user within a call. Spans are
/// append-only; a rejoin after a disconnect opens a new span instead of
/// mutating a prior one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: Uuid,
    pub call_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl ParticipantRecord {
    pub fn open(call_id: Uuid, user_id: Uuid, role: ParticipantRole, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id,
            user_id,
            role,
            joined_at: at,
            left_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParticipantRole {
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "patient")]
    Patient,
    #[serde(rename = "observer")]
    Observer,
}

impl Default for ParticipantRole {
    fn default() -> Self {
        ParticipantRole::Observer
    }
}

// ==============================================================================
// EVENT MODELS
// ==============================================================================

/// Events emitted by the video provider's webhook stream, keyed by the
/// provider-issued meeting reference. Arrival order across meetings is
/// unspecified; handlers are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ProviderEvent {
    #[serde(rename = "participant-joined")]
    Joined {
        #[serde(rename = "meetingRef")]
        meeting_ref: String,
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(default)]
        role: ParticipantRole,
        #[serde(rename = "timestamp")]
        at: DateTime<Utc>,
    },
    #[serde(rename = "participant-left")]
    Left {
        #[serde(rename = "meetingRef")]
        meeting_ref: String,
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(rename = "timestamp")]
        at: DateTime<Utc>,
    },
    #[serde(rename = "recording-started")]
    RecordingStarted {
        #[serde(rename = "meetingRef")]
        meeting_ref: String,
        #[serde(rename = "timestamp")]
        at: DateTime<Utc>,
    },
    #[serde(rename = "recording-stopped")]
    RecordingStopped {
        #[serde(rename = "meetingRef")]
        meeting_ref: String,
        #[serde(rename = "timestamp")]
        at: DateTime<Utc>,
    },
}

impl ProviderEvent {
    pub fn meeting_ref(&self) -> &str {
        match self {
            ProviderEvent::Joined { meeting_ref, .. }
            | ProviderEvent::Left { meeting_ref, .. }
            | ProviderEvent::RecordingStarted { meeting_ref, .. }
            | ProviderEvent::RecordingStopped { meeting_ref, .. } => meeting_ref,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeFeedOp {
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
}

/// Row-level mutation event from the backend store change-feed. Delivery is
/// at-least-once; consumers absorb redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeFeedEvent {
    pub table: String,
    pub operation: ChangeFeedOp,
    pub row: serde_json::Value,
}

impl ChangeFeedEvent {
    /// Row id, when the payload carries one.
    pub fn row_id(&self) -> Option<Uuid> {
        self.row
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Domain event consumed by the external notification component. The core
/// does not format or deliver notifications itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallNotification {
    pub appointment_id: Uuid,
    pub event: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationKind {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "ended")]
    Ended,
}

/// What triggered a guarded finalize. Logged with the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    LastParticipantLeft,
    ForceEnd,
    ChangeFeed,
    Watchdog,
}

impl std::fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinalizeReason::LastParticipantLeft => "last participant left",
            FinalizeReason::ForceEnd => "staff force-end",
            FinalizeReason::ChangeFeed => "change-feed reconciliation",
            FinalizeReason::Watchdog => "watchdog ceiling",
        };
        f.write_str(s)
    }
}

// ==============================================================================
// CONFIGURATION
// ==============================================================================

/// Tunables for the orchestration core. Defaults suit production; tests
/// shrink the timers.
#[derive(Debug, Clone)]
pub struct CallOrchestrationConfig {
    /// Tolerance window after the last participant leaves before the call is
    /// declared over; a rejoin within the window aborts termination.
    pub grace_period: Duration,
    /// Hard ceiling after which an ongoing call with no participants is
    /// force-finalized.
    pub watchdog_ceiling: Duration,
    pub watchdog_interval: Duration,
    /// Change-feed poll cadence.
    pub feed_poll_interval: Duration,
    /// Cursor overlap; guarantees at-least-once delivery across polls.
    pub feed_overlap: Duration,
    pub finalize_retry_attempts: u32,
    pub finalize_retry_backoff: Duration,
}

impl Default for CallOrchestrationConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            watchdog_ceiling: Duration::from_secs(60 * 60),
            watchdog_interval: Duration::from_secs(60),
            feed_poll_interval: Duration::from_secs(2),
            feed_overlap: Duration::from_secs(1),
            finalize_retry_attempts: 3,
            finalize_retry_backoff: Duration::from_millis(200),
        }
    }
}

// ==============================================================================
// API REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Serialize)]
pub struct CreateCallSessionResponse {
    pub success: bool,
    pub session: CallSession,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ForceEndResponse {
    pub success: bool,
    pub session: CallSession,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CallParticipantsResponse {
    pub call_id: Uuid,
    pub participants: Vec<ParticipantRecord>,
    pub active_count: usize,
}

// ==============================================================================
// ERROR HANDLING
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CallOrchestrationError {
    #[error("Call session not found")]
    SessionNotFound,

    #[error("Appointment not found or invalid")]
    AppointmentNotFound,

    #[error("Call session is not in a state that allows this operation: {status}")]
    InvalidSessionState { status: String },

    #[error("An ongoing call already exists for this appointment")]
    OngoingCallExists,

    #[error("Video provider API error: {message}")]
    ProviderApiError { message: String },

    #[error("Video provider not configured")]
    ProviderNotConfigured,

    #[error("Database error: {message}")]
    DatabaseError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<anyhow::Error> for CallOrchestrationError {
    fn from(err: anyhow::Error) -> Self {
        CallOrchestrationError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for CallOrchestrationError {
    fn from(err: reqwest::Error) -> Self {
        CallOrchestrationError::ProviderApiError {
            message: err.to_string(),
        }
    }
}
