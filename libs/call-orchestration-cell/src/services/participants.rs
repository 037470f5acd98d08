// libs/call-orchestration-cell/src/services/participants.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{CallOrchestrationError, ParticipantRecord, ParticipantRole};
use crate::services::store::CallStore;

/// Append-only log of presence spans, one open span per present participant.
/// The active count is recomputed from stored spans on every query: multiple
/// independent clients report events for the same call, so a cached local
/// count cannot be trusted.
pub struct ParticipantTracker {
    store: Arc<dyn CallStore>,
}

impl ParticipantTracker {
    pub fn new(store: Arc<dyn CallStore>) -> Self {
        Self { store }
    }

    /// Open a new span. An already-open span for the same user means a leave
    /// event was lost or duplicated upstream; it is closed at `at` before the
    /// new span opens.
    pub async fn add_join(
        &self,
        call_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError> {
        let open = self.store.open_spans(call_id).await?;
        for span in open.iter().filter(|s| s.user_id == user_id) {
            warn!(
                "Closing stale open span {} for user {} in call {} before rejoin",
                span.id, user_id, call_id
            );
            self.store.close_span(span.id, at).await?;
        }

        let span = ParticipantRecord::open(call_id, user_id, role, at);
        self.store.insert_span(&span).await?;

        debug!("Opened span {} for user {} in call {}", span.id, user_id, call_id);
        Ok(())
    }

    /// Close the most recent open span for the user. A leave with no open
    /// span is a duplicate and is absorbed.
    pub async fn add_leave(
        &self,
        call_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError> {
        let open = self.store.open_spans(call_id).await?;
        let latest = open
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.joined_at);

        match latest {
            Some(span) => {
                // leftAt must not precede joinedAt, even with skewed clocks
                let left_at = if at < span.joined_at { span.joined_at } else { at };
                self.store.close_span(span.id, left_at).await?;
                debug!("Closed span {} for user {} in call {}", span.id, user_id, call_id);
            }
            None => {
                debug!(
                    "Ignoring leave for user {} in call {} with no open span",
                    user_id, call_id
                );
            }
        }

        Ok(())
    }

    /// Number of currently-open spans, recomputed from the store.
    pub async fn active_count(&self, call_id: Uuid) -> Result<usize, CallOrchestrationError> {
        Ok(self.store.open_spans(call_id).await?.len())
    }

    /// Close every open span at `at`. Used by force-end and finalize so a
    /// terminated call leaves no dangling presence.
    pub async fn close_all_open(
        &self,
        call_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<usize, CallOrchestrationError> {
        let open = self.store.open_spans(call_id).await?;
        let closed = open.len();
        for span in open {
            let left_at = if at < span.joined_at { span.joined_at } else { at };
            self.store.close_span(span.id, left_at).await?;
        }
        Ok(closed)
    }
}
