// libs/call-orchestration-cell/src/services/sync_bridge.rs
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::models::{CallOrchestrationConfig, CallOrchestrationError, ChangeFeedEvent, ChangeFeedOp};
use crate::services::session_manager::VideoCallSessionManager;
use crate::services::store::CallStore;

/// Bridges the backend store change-feed into the session manager.
///
/// The feed is at-least-once: the poll cursor keeps an overlap window, so a
/// row can be delivered again after it was already applied; the manager's
/// reconciliation handlers absorb that. After any feed failure the bridge
/// assumes events were missed and runs a full reconciliation pass instead of
/// trusting the cursor.
pub struct RealtimeSyncBridge {
    store: Arc<dyn CallStore>,
    manager: Arc<VideoCallSessionManager>,
    config: CallOrchestrationConfig,
    cursor: Mutex<DateTime<Utc>>,
}

impl RealtimeSyncBridge {
    pub fn new(
        store: Arc<dyn CallStore>,
        manager: Arc<VideoCallSessionManager>,
        config: CallOrchestrationConfig,
    ) -> Self {
        Self {
            store,
            manager,
            config,
            cursor: Mutex::new(Utc::now()),
        }
    }

    /// Long-lived subscription loop. Run this in a dedicated tokio task.
    pub async fn run(self: Arc<Self>) {
        info!("Starting realtime sync bridge");

        // we were not listening until now; derive instead of assuming
        if let Err(e) = self.reconcile_all().await {
            error!("Initial reconciliation failed: {}", e);
        }

        let mut healthy = true;
        loop {
            tokio::time::sleep(self.config.feed_poll_interval).await;

            match self.poll_once().await {
                Ok(events) => {
                    if !healthy {
                        healthy = true;
                        info!("Change feed restored, running full reconciliation");
                        if let Err(e) = self.reconcile_all().await {
                            error!("Post-reconnect reconciliation failed: {}", e);
                        }
                    }
                    for event in events {
                        if let Err(e) = self.manager.handle_change_feed_event(event).await {
                            error!("Change-feed event handling failed: {}", e);
                        }
                    }
                }
                Err(e) => {
                    if healthy {
                        warn!("Change feed poll failed, entering degraded mode: {}", e);
                        healthy = false;
                    } else {
                        debug!("Change feed still unavailable: {}", e);
                    }
                }
            }
        }
    }

    /// One poll of the feed: rows touched since the cursor (minus the
    /// overlap), coalesced per row so a burst of updates becomes one event.
    pub async fn poll_once(&self) -> Result<Vec<ChangeFeedEvent>, CallOrchestrationError> {
        let overlap = chrono::Duration::from_std(self.config.feed_overlap)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let since = *self.cursor.lock().await - overlap;

        let call_rows = self.store.calls_updated_since(since).await?;
        let appointment_rows = self.store.appointments_updated_since(since).await?;

        let mut max_seen = *self.cursor.lock().await;
        let mut events = Vec::new();
        events.extend(Self::coalesce("video_calls", call_rows, &mut max_seen));
        events.extend(Self::coalesce("appointments", appointment_rows, &mut max_seen));

        *self.cursor.lock().await = max_seen;

        if !events.is_empty() {
            debug!("Change feed poll produced {} event(s)", events.len());
        }
        Ok(events)
    }

    /// Full reconciliation pass: retry deferred finalize writes, settle rows
    /// flagged by a previous process, and re-derive every open call's state.
    pub async fn reconcile_all(&self) -> Result<(), CallOrchestrationError> {
        self.manager.retry_pending_finalizations().await;

        let mut rows = Vec::new();
        rows.extend(self.store.calls_needing_reconciliation().await?);
        rows.extend(self.store.open_calls().await?);

        let mut seen = HashMap::new();
        for call in rows {
            seen.entry(call.id).or_insert(call);
        }

        for (_, call) in seen {
            let row = serde_json::to_value(&call).map_err(|e| CallOrchestrationError::Internal {
                message: e.to_string(),
            })?;
            let event = ChangeFeedEvent {
                table: "video_calls".to_string(),
                operation: ChangeFeedOp::Update,
                row,
            };
            if let Err(e) = self.manager.handle_change_feed_event(event).await {
                error!("Reconciliation of call {} failed: {}", call.id, e);
            }
        }

        Ok(())
    }

    /// Keep the latest row per id within a batch. Rows arrive oldest first,
    /// so a later row overwrites an earlier one.
    fn coalesce(
        table: &str,
        rows: Vec<serde_json::Value>,
        max_seen: &mut DateTime<Utc>,
    ) -> Vec<ChangeFeedEvent> {
        let mut latest: HashMap<String, ChangeFeedEvent> = HashMap::new();
        let mut anonymous = Vec::new();

        for row in rows {
            if let Some(updated) = row
                .get("updated_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                let updated = updated.with_timezone(&Utc);
                if updated > *max_seen {
                    *max_seen = updated;
                }
            }

            let operation = match (row.get("created_at"), row.get("updated_at")) {
                (Some(c), Some(u)) if c == u => ChangeFeedOp::Insert,
                _ => ChangeFeedOp::Update,
            };

            let event = ChangeFeedEvent {
                table: table.to_string(),
                operation,
                row: row.clone(),
            };

            match row.get("id").and_then(|v| v.as_str()) {
                Some(id) => {
                    latest.insert(id.to_string(), event);
                }
                None => anonymous.push(event),
            }
        }

        let mut events: Vec<ChangeFeedEvent> = latest.into_values().collect();
        events.extend(anonymous);
        events
    }
}
