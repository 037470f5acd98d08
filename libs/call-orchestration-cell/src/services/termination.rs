// libs/call-orchestration-cell/src/services/termination.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{CallOrchestrationConfig, CallOrchestrationError, CallSession, CallStatus};
use crate::services::participants::ParticipantTracker;

/// The single decision point for "is this call over?". The session manager
/// never infers termination from anything else.
pub struct CallTerminationPolicy {
    tracker: Arc<ParticipantTracker>,
    grace_period: Duration,
    watchdog_ceiling: Duration,
}

impl CallTerminationPolicy {
    pub fn new(tracker: Arc<ParticipantTracker>, config: &CallOrchestrationConfig) -> Self {
        Self {
            tracker,
            grace_period: config.grace_period,
            watchdog_ceiling: config.watchdog_ceiling,
        }
    }

    /// True iff the session is ongoing and the authoritative participant
    /// count is zero. The count comes from persisted spans, never a local
    /// cache.
    pub async fn should_terminate(
        &self,
        session: &CallSession,
    ) -> Result<bool, CallOrchestrationError> {
        if session.status != CallStatus::Ongoing {
            return Ok(false);
        }
        Ok(self.tracker.active_count(session.id).await? == 0)
    }

    /// Tolerance window between the last leave and termination; a rejoin
    /// inside the window aborts the pending finalize.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// True when an empty ongoing call has outlived the hard ceiling and the
    /// watchdog must force-finalize it.
    pub fn past_watchdog_ceiling(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - last_activity).to_std() {
            Ok(age) => age > self.watchdog_ceiling,
            Err(_) => false, // last_activity in the future: clock skew, leave it alone
        }
    }

    /// Final call duration in whole minutes.
    pub fn duration_minutes(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
        (ended_at - started_at).num_minutes().max(0)
    }
}
