// libs/call-orchestration-cell/src/services/session_manager.rs
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    CallNotification, CallOrchestrationConfig, CallOrchestrationError, CallSession, CallStatus,
    ChangeFeedEvent, FinalizeReason, NotificationKind, ParticipantRecord, ParticipantRole,
    ProviderEvent,
};
use crate::services::participants::ParticipantTracker;
use crate::services::provider::MeetingProvider;
use crate::services::recording::RecordingController;
use crate::services::store::CallStore;
use crate::services::termination::CallTerminationPolicy;

/// A finalize decision whose durable write has not landed yet. Kept so the
/// retried write preserves the original end time.
#[derive(Debug, Clone, Copy)]
struct PendingFinalize {
    ended_at: DateTime<Utc>,
    duration_minutes: Option<i64>,
}

/// Owns the call lifecycle state machine. Consumes provider events and
/// change-feed events, drives the tracker / termination policy / recording
/// controller, and persists the resulting state.
///
/// Event handling is serialized per session through a mutex registry;
/// different sessions proceed in parallel. Cross-source ordering is not
/// assumed anywhere: every transition is idempotent and the participant count
/// is re-derived from the store on each decision.
pub struct VideoCallSessionManager {
    store: Arc<dyn CallStore>,
    provider: Option<Arc<dyn MeetingProvider>>,
    tracker: Arc<ParticipantTracker>,
    policy: Arc<CallTerminationPolicy>,
    recording: Arc<RecordingController>,
    config: CallOrchestrationConfig,

    session_locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    pending_terminations: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    pending_finalizes: Mutex<HashMap<Uuid, PendingFinalize>>,
    /// Sessions whose terminal transition has already been observed, so
    /// change-feed redelivery stays silent.
    settled_terminal: Mutex<HashSet<Uuid>>,

    notifications: broadcast::Sender<CallNotification>,
    /// Handle back to the owning Arc, for spawning grace timers.
    self_ref: Weak<VideoCallSessionManager>,
}

impl VideoCallSessionManager {
    pub fn new(
        store: Arc<dyn CallStore>,
        provider: Option<Arc<dyn MeetingProvider>>,
        config: CallOrchestrationConfig,
    ) -> Arc<Self> {
        let tracker = Arc::new(ParticipantTracker::new(Arc::clone(&store)));
        let policy = Arc::new(CallTerminationPolicy::new(Arc::clone(&tracker), &config));
        let recording = Arc::new(RecordingController::new(provider.clone(), Arc::clone(&store)));
        let (notifications, _) = broadcast::channel(256);

        Arc::new_cyclic(|self_ref| Self {
            store,
            provider,
            tracker,
            policy,
            recording,
            config,
            session_locks: RwLock::new(HashMap::new()),
            pending_terminations: Mutex::new(HashMap::new()),
            pending_finalizes: Mutex::new(HashMap::new()),
            settled_terminal: Mutex::new(HashSet::new()),
            notifications,
            self_ref: self_ref.clone(),
        })
    }

    /// Domain events for the external notification collaborator.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<CallNotification> {
        self.notifications.subscribe()
    }

    // ==========================================================================
    // SESSION CREATION (booking-time entry point)
    // ==========================================================================

    /// Create a scheduled call session for an appointment. A missing provider
    /// configuration is the one hard error that propagates to the caller.
    #[instrument(skip(self))]
    pub async fn create_session_for_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<CallSession, CallOrchestrationError> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(CallOrchestrationError::ProviderNotConfigured)?;

        let appointment = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or(CallOrchestrationError::AppointmentNotFound)?;

        if appointment["status"].as_str() == Some("cancelled") {
            return Err(CallOrchestrationError::ValidationError {
                message: "Appointment is cancelled".to_string(),
            });
        }

        if self
            .store
            .ongoing_call_for_appointment(appointment_id)
            .await?
            .is_some()
        {
            return Err(CallOrchestrationError::OngoingCallExists);
        }

        let scheduled_for = appointment["appointment_date"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let meeting_ref = provider.create_meeting().await?;
        let session = CallSession::new(appointment_id, meeting_ref, scheduled_for);
        self.store.insert_call(&session).await?;

        info!(
            "Created call session {} for appointment {} (meeting {})",
            session.id, appointment_id, session.meeting_ref
        );
        Ok(session)
    }

    // ==========================================================================
    // PROVIDER EVENT HANDLING
    // ==========================================================================

    /// Entry point for the provider webhook stream. Unknown meeting refs are
    /// discarded; events for terminated sessions are absorbed.
    #[instrument(skip(self, event), fields(meeting_ref = %event.meeting_ref()))]
    pub async fn handle_provider_event(
        &self,
        event: ProviderEvent,
    ) -> Result<(), CallOrchestrationError> {
        let Some(existing) = self.store.find_by_meeting_ref(event.meeting_ref()).await? else {
            warn!(
                "Discarding provider event for unknown meeting ref {}",
                event.meeting_ref()
            );
            return Ok(());
        };

        let lock = self.session_lock(existing.id).await;
        let _guard = lock.lock().await;

        // the unlocked lookup raced other handlers; re-read under the lock
        let Some(session) = self.store.get_call(existing.id).await? else {
            return Ok(());
        };
        if session.status.is_terminal() {
            debug!("Ignoring provider event for terminated call {}", session.id);
            return Ok(());
        }

        match event {
            ProviderEvent::Joined {
                user_id, role, at, ..
            } => self.on_joined(session, user_id, role, at).await,
            ProviderEvent::Left { user_id, at, .. } => self.on_left(session, user_id, at).await,
            ProviderEvent::RecordingStarted { .. } => {
                self.recording.confirm_from_provider(&session, true).await
            }
            ProviderEvent::RecordingStopped { .. } => {
                self.recording.confirm_from_provider(&session, false).await
            }
        }
    }

    async fn on_joined(
        &self,
        mut session: CallSession,
        user_id: Uuid,
        role: ParticipantRole,
        at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError> {
        // a rejoin within the grace window aborts pending termination
        self.cancel_pending_termination(session.id).await;

        if session.status == CallStatus::Scheduled {
            if let Some(other) = self
                .store
                .ongoing_call_for_appointment(session.appointment_id)
                .await?
            {
                if other.id != session.id {
                    warn!(
                        "Appointment {} already has ongoing call {}, refusing first join of {}",
                        session.appointment_id, other.id, session.id
                    );
                    return Err(CallOrchestrationError::OngoingCallExists);
                }
            }

            let started_at = session.started_at.unwrap_or(at);
            if self.store.mark_ongoing(session.id, started_at).await? {
                session.status = CallStatus::Ongoing;
                session.started_at = Some(started_at);
                self.publish(CallNotification {
                    appointment_id: session.appointment_id,
                    event: NotificationKind::Started,
                    duration_minutes: None,
                });
                info!("Call {} started on first join", session.id);
            } else {
                // scheduled -> ongoing precondition failed: another writer got
                // there first (possibly a cancellation)
                let Some(current) = self.store.get_call(session.id).await? else {
                    return Ok(());
                };
                if current.status.is_terminal() {
                    debug!("Join arrived for call {} after termination, ignoring", session.id);
                    return Ok(());
                }
                session = current;
            }
        }

        self.tracker.add_join(session.id, user_id, role, at).await
    }

    async fn on_left(
        &self,
        session: CallSession,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CallOrchestrationError> {
        self.tracker.add_leave(session.id, user_id, at).await?;

        if self.policy.should_terminate(&session).await? {
            info!(
                "Call {} has no active participants, arming termination timer",
                session.id
            );
            self.schedule_grace_termination(session.id).await;
        }

        Ok(())
    }

    // ==========================================================================
    // CHANGE-FEED RECONCILIATION
    // ==========================================================================

    /// Reconcile an out-of-band store mutation. Re-applying an
    /// already-applied final state is a no-op.
    #[instrument(skip(self, event), fields(table = %event.table))]
    pub async fn handle_change_feed_event(
        &self,
        event: ChangeFeedEvent,
    ) -> Result<(), CallOrchestrationError> {
        match event.table.as_str() {
            "video_calls" => self.reconcile_call_row(&event).await,
            "appointments" => self.reconcile_appointment_row(&event).await,
            "video_call_participants" => self.reconcile_participant_row(&event).await,
            other => {
                debug!("Ignoring change-feed event for table {}", other);
                Ok(())
            }
        }
    }

    async fn reconcile_call_row(
        &self,
        event: &ChangeFeedEvent,
    ) -> Result<(), CallOrchestrationError> {
        let Some(id) = event.row_id() else {
            debug!("Change-feed call row without id, ignoring");
            return Ok(());
        };

        let lock = self.session_lock(id).await;
        let _guard = lock.lock().await;

        // the store row is the truth; the feed payload may be stale
        let Some(session) = self.store.get_call(id).await? else {
            return Ok(());
        };

        if session.status.is_terminal() {
            self.settle_terminated(&session).await?;
            return Ok(());
        }

        if session.needs_reconciliation {
            // a previous process decided completion but never landed the write
            warn!(
                "Call {} flagged for reconciliation while still {}, finalizing",
                session.id, session.status
            );
            return self.finalize_locked(&session, FinalizeReason::ChangeFeed).await;
        }

        if session.status == CallStatus::Ongoing && self.policy.should_terminate(&session).await? {
            self.schedule_grace_termination(session.id).await;
        }

        Ok(())
    }

    /// Settle local state for a session the store already shows as terminal:
    /// cancel timers, close dangling spans, release the recording. Publishes
    /// the ended notification only on the first terminal sighting.
    async fn settle_terminated(
        &self,
        session: &CallSession,
    ) -> Result<(), CallOrchestrationError> {
        let first_sighting = self.settled_terminal.lock().await.insert(session.id);

        self.cancel_pending_termination(session.id).await;

        let closed_at = session.ended_at.unwrap_or_else(Utc::now);
        self.tracker.close_all_open(session.id, closed_at).await?;

        if session.is_recording {
            self.recording.force_stop(session).await;
        }

        if session.needs_reconciliation {
            self.store.set_needs_reconciliation(session.id, false).await?;
        }
        self.pending_finalizes.lock().await.remove(&session.id);

        if first_sighting && session.status == CallStatus::Completed {
            self.publish(CallNotification {
                appointment_id: session.appointment_id,
                event: NotificationKind::Ended,
                duration_minutes: session.duration_minutes,
            });
            info!("Reconciled out-of-band completion of call {}", session.id);
        }

        Ok(())
    }

    async fn reconcile_appointment_row(
        &self,
        event: &ChangeFeedEvent,
    ) -> Result<(), CallOrchestrationError> {
        if event.row["status"].as_str() != Some("cancelled") {
            return Ok(());
        }
        let Some(appointment_id) = event.row_id() else {
            return Ok(());
        };

        for call in self.store.calls_for_appointment(appointment_id).await? {
            let lock = self.session_lock(call.id).await;
            let _guard = lock.lock().await;

            let Some(current) = self.store.get_call(call.id).await? else {
                continue;
            };
            match current.status {
                CallStatus::Scheduled => {
                    if self.store.cancel_call(current.id, Utc::now()).await? {
                        self.settled_terminal.lock().await.insert(current.id);
                        info!(
                            "Cancelled call {} for cancelled appointment {}",
                            current.id, appointment_id
                        );
                        self.release_meeting(&current).await;
                    }
                    // a lost CAS means a concurrent join or cancellation won;
                    // redelivery lands here again and no-ops
                }
                CallStatus::Ongoing => {
                    // staff cancelled the appointment mid-call
                    self.finalize_locked(&current, FinalizeReason::ChangeFeed)
                        .await?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn reconcile_participant_row(
        &self,
        event: &ChangeFeedEvent,
    ) -> Result<(), CallOrchestrationError> {
        let Some(call_id) = event
            .row
            .get("call_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(());
        };

        let lock = self.session_lock(call_id).await;
        let _guard = lock.lock().await;

        let Some(session) = self.store.get_call(call_id).await? else {
            return Ok(());
        };
        if session.status == CallStatus::Ongoing && self.policy.should_terminate(&session).await? {
            self.schedule_grace_termination(session.id).await;
        }

        Ok(())
    }

    // ==========================================================================
    // MANAGEMENT INTERFACE
    // ==========================================================================

    /// Staff force-end. Goes through the same guarded finalize as the
    /// termination policy; open spans are closed at the end time.
    #[instrument(skip(self))]
    pub async fn force_end(
        &self,
        session_id: Uuid,
    ) -> Result<CallSession, CallOrchestrationError> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let Some(session) = self.store.get_call(session_id).await? else {
            return Err(CallOrchestrationError::SessionNotFound);
        };

        match session.status {
            CallStatus::Completed | CallStatus::Cancelled => {
                debug!("Force-end of already-terminated call {}", session_id);
            }
            CallStatus::Scheduled => {
                if self.store.cancel_call(session.id, Utc::now()).await? {
                    self.settled_terminal.lock().await.insert(session.id);
                    info!("Force-end cancelled never-started call {}", session.id);
                    self.release_meeting(&session).await;
                }
            }
            CallStatus::Ongoing => {
                self.finalize_locked(&session, FinalizeReason::ForceEnd).await?;
            }
        }

        self.store
            .get_call(session_id)
            .await?
            .ok_or(CallOrchestrationError::SessionNotFound)
    }

    pub async fn get_session(
        &self,
        session_id: Uuid,
    ) -> Result<CallSession, CallOrchestrationError> {
        self.store
            .get_call(session_id)
            .await?
            .ok_or(CallOrchestrationError::SessionNotFound)
    }

    pub async fn session_participants(
        &self,
        session_id: Uuid,
    ) -> Result<(Vec<ParticipantRecord>, usize), CallOrchestrationError> {
        let spans = self.store.spans_for_call(session_id).await?;
        let active = spans.iter().filter(|s| s.is_open()).count();
        Ok((spans, active))
    }

    /// Management recording start; the flag flips after provider confirmation.
    pub async fn start_recording(
        &self,
        session_id: Uuid,
    ) -> Result<(), CallOrchestrationError> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let session = self.get_session(session_id).await?;
        self.recording.start(&session).await?;
        Ok(())
    }

    pub async fn stop_recording(
        &self,
        session_id: Uuid,
    ) -> Result<(), CallOrchestrationError> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let session = self.get_session(session_id).await?;
        self.recording.stop(&session).await?;
        Ok(())
    }

    pub async fn provider_health(&self) -> bool {
        match &self.provider {
            Some(provider) => provider.health_check().await.unwrap_or(false),
            None => false,
        }
    }

    // ==========================================================================
    // FINALIZATION
    // ==========================================================================

    /// Guarded finalize: executes at most once per session. The status
    /// precondition travels with the write; losing the compare-and-set means
    /// another trigger won and this call backs off. Must be called with the
    /// session lock held.
    async fn finalize_locked(
        &self,
        session: &CallSession,
        reason: FinalizeReason,
    ) -> Result<(), CallOrchestrationError> {
        let ended_at = Utc::now();
        let duration_minutes = session
            .started_at
            .map(|started| CallTerminationPolicy::duration_minutes(started, ended_at));

        self.cancel_pending_termination(session.id).await;
        self.settled_terminal.lock().await.insert(session.id);

        let mut persisted = false;
        let mut attempt: u32 = 0;
        loop {
            match self
                .store
                .finalize_call(session.id, ended_at, duration_minutes)
                .await
            {
                Ok(true) => {
                    persisted = true;
                    break;
                }
                Ok(false) => {
                    // another trigger finalized first; at-most-once holds
                    debug!("Call {} already finalized elsewhere ({})", session.id, reason);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.finalize_retry_attempts {
                        error!(
                            "Finalize write for call {} failed after {} attempts: {}",
                            session.id, attempt, e
                        );
                        break;
                    }
                    let jitter = rand::thread_rng().gen_range(0..50);
                    let backoff = self.config.finalize_retry_backoff * 2u32.pow(attempt - 1)
                        + Duration::from_millis(jitter);
                    warn!(
                        "Finalize write for call {} failed (attempt {}): {}; retrying",
                        session.id, attempt, e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        if !persisted {
            // never leave a session permanently ongoing over a transient
            // failure: complete locally, let the sync bridge push the write
            self.pending_finalizes.lock().await.insert(
                session.id,
                PendingFinalize {
                    ended_at,
                    duration_minutes,
                },
            );
            if let Err(e) = self.store.set_needs_reconciliation(session.id, true).await {
                warn!("Could not flag call {} for reconciliation: {}", session.id, e);
            }
        }

        self.recording.force_stop(session).await;

        if let Err(e) = self.tracker.close_all_open(session.id, ended_at).await {
            warn!("Failed closing open spans for finalized call {}: {}", session.id, e);
        }

        self.session_locks.write().await.remove(&session.id);

        self.publish(CallNotification {
            appointment_id: session.appointment_id,
            event: NotificationKind::Ended,
            duration_minutes,
        });

        info!(
            "Call {} finalized ({}), duration {:?} minutes, persisted: {}",
            session.id, reason, duration_minutes, persisted
        );
        Ok(())
    }

    /// Retry finalize writes that never landed. Invoked by the sync bridge on
    /// every reconciliation pass.
    pub async fn retry_pending_finalizations(&self) {
        let pending: Vec<(Uuid, PendingFinalize)> = self
            .pending_finalizes
            .lock()
            .await
            .iter()
            .map(|(id, p)| (*id, *p))
            .collect();

        for (id, p) in pending {
            let lock = self.session_lock(id).await;
            let _guard = lock.lock().await;

            match self
                .store
                .finalize_call(id, p.ended_at, p.duration_minutes)
                .await
            {
                Ok(won) => {
                    if won {
                        info!("Reconciled delayed finalize for call {}", id);
                    }
                    self.pending_finalizes.lock().await.remove(&id);
                }
                Err(e) => {
                    warn!("Deferred finalize for call {} still failing: {}", id, e);
                }
            }
        }
    }

    // ==========================================================================
    // GRACE-PERIOD TERMINATION
    // ==========================================================================

    /// Arm a cancellable termination timer for the session. A join event for
    /// the same session aborts it. No-op when a timer is already armed.
    async fn schedule_grace_termination(&self, session_id: Uuid) {
        let mut pending = self.pending_terminations.lock().await;
        if pending.contains_key(&session_id) {
            return;
        }

        let grace = self.policy.grace_period();
        debug!("Arming termination timer for call {} ({:?})", session_id, grace);

        let Some(mgr) = self.self_ref.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            mgr.pending_terminations.lock().await.remove(&session_id);
            if let Err(e) = mgr.finalize_if_still_empty(session_id).await {
                error!("Grace-period finalize failed for call {}: {}", session_id, e);
            }
        });
        pending.insert(session_id, handle);
    }

    async fn finalize_if_still_empty(
        &self,
        session_id: Uuid,
    ) -> Result<(), CallOrchestrationError> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let Some(session) = self.store.get_call(session_id).await? else {
            return Ok(());
        };
        if session.status.is_terminal() {
            return Ok(());
        }

        // a join may have slipped in while the timer slept
        if self.policy.should_terminate(&session).await? {
            self.finalize_locked(&session, FinalizeReason::LastParticipantLeft)
                .await?;
        } else {
            debug!("Termination aborted for call {}: participants present", session_id);
        }

        Ok(())
    }

    async fn cancel_pending_termination(&self, session_id: Uuid) {
        if let Some(handle) = self.pending_terminations.lock().await.remove(&session_id) {
            handle.abort();
            debug!("Cancelled pending termination for call {}", session_id);
        }
    }

    /// True while a termination timer is armed. Exposed for tests.
    pub async fn has_pending_termination(&self, session_id: Uuid) -> bool {
        self.pending_terminations.lock().await.contains_key(&session_id)
    }

    // ==========================================================================
    // WATCHDOG
    // ==========================================================================

    /// Background loop bounding the lifetime of leaked sessions. Run this in
    /// a dedicated tokio task.
    pub async fn run_watchdog(self: Arc<Self>) {
        info!("Starting call session watchdog");
        loop {
            tokio::time::sleep(self.config.watchdog_interval).await;
            if let Err(e) = self.watchdog_pass().await {
                error!("Watchdog pass failed: {}", e);
            }
        }
    }

    /// One sweep over non-terminal calls. Ongoing calls that sat empty past
    /// the ceiling are force-finalized; scheduled calls whose slot is long
    /// gone are cancelled.
    pub async fn watchdog_pass(&self) -> Result<(), CallOrchestrationError> {
        let now = Utc::now();

        for call in self.store.open_calls().await? {
            match call.status {
                CallStatus::Ongoing => {
                    let spans = self.store.spans_for_call(call.id).await?;
                    if spans.iter().any(|s| s.is_open()) {
                        continue;
                    }
                    let last_activity = spans
                        .iter()
                        .filter_map(|s| s.left_at)
                        .max()
                        .unwrap_or(call.updated_at);
                    if self.policy.past_watchdog_ceiling(last_activity, now) {
                        warn!("Watchdog force-finalizing stale ongoing call {}", call.id);
                        let lock = self.session_lock(call.id).await;
                        let _guard = lock.lock().await;
                        if let Some(current) = self.store.get_call(call.id).await? {
                            if current.status == CallStatus::Ongoing {
                                self.finalize_locked(&current, FinalizeReason::Watchdog).await?;
                            }
                        }
                    }
                }
                CallStatus::Scheduled => {
                    let slot = call.scheduled_for.unwrap_or(call.created_at);
                    if self.policy.past_watchdog_ceiling(slot, now) {
                        let lock = self.session_lock(call.id).await;
                        let _guard = lock.lock().await;
                        if self.store.cancel_call(call.id, now).await? {
                            self.settled_terminal.lock().await.insert(call.id);
                            info!("Watchdog cancelled never-started call {}", call.id);
                            self.release_meeting(&call).await;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    // ==========================================================================
    // INTERNALS
    // ==========================================================================

    async fn session_lock(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        {
            let locks = self.session_locks.read().await;
            if let Some(lock) = locks.get(&session_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.session_locks.write().await;
        Arc::clone(locks.entry(session_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    async fn release_meeting(&self, session: &CallSession) {
        if let Some(provider) = &self.provider {
            if let Err(e) = provider.end_meeting(&session.meeting_ref).await {
                warn!(
                    "Provider meeting cleanup failed for call {}: {}",
                    session.id, e
                );
            }
        }
    }

    fn publish(&self, notification: CallNotification) {
        if let Err(e) = self.notifications.send(notification) {
            debug!("No notification subscribers: {}", e);
        }
    }
}
