// libs/call-orchestration-cell/src/services/recording.rs
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{CallOrchestrationError, CallSession, CallStatus};
use crate::services::provider::MeetingProvider;
use crate::services::store::CallStore;

/// Idempotent recording toggle, decoupled from the session lifecycle. The
/// persisted flag is authoritative only after provider confirmation; a flag
/// inferred from client UI state is never written here.
pub struct RecordingController {
    provider: Option<Arc<dyn MeetingProvider>>,
    store: Arc<dyn CallStore>,
}

impl RecordingController {
    pub fn new(provider: Option<Arc<dyn MeetingProvider>>, store: Arc<dyn CallStore>) -> Self {
        Self { provider, store }
    }

    /// Start recording. No-op when already recording; the flag flips only
    /// after the provider acknowledges.
    pub async fn start(&self, session: &CallSession) -> Result<bool, CallOrchestrationError> {
        if session.status != CallStatus::Ongoing {
            return Err(CallOrchestrationError::InvalidSessionState {
                status: session.status.to_string(),
            });
        }
        if session.is_recording {
            debug!("Call {} already recording, ignoring start", session.id);
            return Ok(false);
        }

        let provider = self
            .provider
            .as_ref()
            .ok_or(CallOrchestrationError::ProviderNotConfigured)?;

        provider.start_recording(&session.meeting_ref).await?;
        self.store.set_recording(session.id, true).await?;

        info!("Recording started for call {}", session.id);
        Ok(true)
    }

    /// Stop recording. No-op when not recording.
    pub async fn stop(&self, session: &CallSession) -> Result<bool, CallOrchestrationError> {
        if !session.is_recording {
            debug!("Call {} not recording, ignoring stop", session.id);
            return Ok(false);
        }

        let provider = self
            .provider
            .as_ref()
            .ok_or(CallOrchestrationError::ProviderNotConfigured)?;

        provider.stop_recording(&session.meeting_ref).await?;
        self.store.set_recording(session.id, false).await?;

        info!("Recording stopped for call {}", session.id);
        Ok(true)
    }

    /// Provider reported the recording state changed (e.g. started from an
    /// in-call control). The event is the confirmation; persist the flag.
    pub async fn confirm_from_provider(
        &self,
        session: &CallSession,
        recording: bool,
    ) -> Result<(), CallOrchestrationError> {
        if session.is_recording == recording {
            debug!(
                "Call {} recording flag already {}, ignoring provider confirmation",
                session.id, recording
            );
            return Ok(());
        }
        self.store.set_recording(session.id, recording).await?;
        info!("Recording flag for call {} set to {} (provider confirmed)", session.id, recording);
        Ok(())
    }

    /// Unconditional stop during finalize so no recording outlives its call.
    /// Provider refusal is tolerated; the meeting may already be gone.
    pub async fn force_stop(&self, session: &CallSession) {
        if !session.is_recording {
            return;
        }

        if let Some(provider) = &self.provider {
            if let Err(e) = provider.stop_recording(&session.meeting_ref).await {
                warn!(
                    "Provider refused recording stop for call {} during finalize: {}",
                    session.id, e
                );
            }
        }

        // finalize_call clears the persisted flag with the status write; this
        // covers the non-finalize force paths
        if let Err(e) = self.store.set_recording(session.id, false).await {
            warn!("Failed to clear recording flag for call {}: {}", session.id, e);
        }
    }
}
