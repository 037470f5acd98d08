// libs/call-orchestration-cell/src/lib.rs
//! # Call Orchestration Cell
//!
//! Turns a scheduled appointment into a live video consultation with a
//! well-defined lifecycle: presence tracking, recording control, and
//! automatic termination, driven by asynchronous events from two independent
//! sources (the realtime video provider and the backend store change-feed).
//!
//! ## Architecture
//!
//! The cell follows the established cell layout:
//!
//! ```text
//! +------------------------------------------------------------+
//! |                  Call Orchestration Cell                   |
//! +------------------------------------------------------------+
//! |  handlers.rs    |  HTTP endpoint handlers                  |
//! |  router.rs      |  Route definitions                       |
//! |  models.rs      |  Domain models, events & errors          |
//! |  services/      |  Business logic layer                    |
//! |    session_manager.rs | Lifecycle state machine            |
//! |    participants.rs    | Presence span log                  |
//! |    termination.rs     | End-of-call decision policy        |
//! |    recording.rs       | Idempotent recording toggle        |
//! |    sync_bridge.rs     | Change-feed subscription           |
//! |    provider.rs        | Realtime provider API client       |
//! |    store.rs           | Persistence seam                   |
//! +------------------------------------------------------------+
//! ```
//!
//! ## Event flow
//!
//! A booking creates a `scheduled` call tied to a provider meeting. The
//! provider webhook stream drives joins and leaves; the first confirmed join
//! makes the call `ongoing`. When the last participant leaves, the
//! termination policy arms a grace timer; unless someone rejoins, the call
//! finalizes to `completed` exactly once, guarded by a compare-and-set on the
//! stored status. The sync bridge independently reconciles out-of-band store
//! mutations (staff force-end, appointment cancellation) through the same
//! idempotent paths.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use call_orchestration_cell::models::CallOrchestrationConfig;
//! use call_orchestration_cell::services::{
//!     MeetingProvider, RealtimeMeetingClient, RealtimeSyncBridge, SupabaseCallStore,
//!     VideoCallSessionManager,
//! };
//! use call_orchestration_cell::router::call_orchestration_routes;
//! use shared_config::AppConfig;
//! use shared_database::supabase::SupabaseClient;
//!
//! let config = AppConfig::from_env();
//! let store = Arc::new(SupabaseCallStore::new(SupabaseClient::new(&config)));
//! let provider = RealtimeMeetingClient::new(&config)
//!     .ok()
//!     .map(|c| Arc::new(c) as Arc<dyn MeetingProvider>);
//! let manager = VideoCallSessionManager::new(
//!     store.clone(),
//!     provider,
//!     CallOrchestrationConfig::default(),
//! );
//! let bridge = Arc::new(RealtimeSyncBridge::new(
//!     store,
//!     manager.clone(),
//!     CallOrchestrationConfig::default(),
//! ));
//! tokio::spawn(bridge.run());
//! tokio::spawn(manager.clone().run_watchdog());
//! let routes = call_orchestration_routes(manager);
//! ```
//!
//! ## Configuration
//!
//! Required environment variables:
//! - `VIDEO_PROVIDER_APP_ID` - provider app identifier
//! - `VIDEO_PROVIDER_API_TOKEN` - API authentication token
//! - `VIDEO_PROVIDER_BASE_URL` - API base URL (optional, defaults to production)

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

// Re-export commonly used types
pub use models::{
    CallNotification, CallOrchestrationConfig, CallOrchestrationError, CallSession, CallStatus,
    ChangeFeedEvent, ChangeFeedOp, NotificationKind, ParticipantRecord, ParticipantRole,
    ProviderEvent,
};

pub use services::{
    CallStore, MeetingProvider, RealtimeMeetingClient, RealtimeSyncBridge, SupabaseCallStore,
    VideoCallSessionManager,
};

pub use router::call_orchestration_routes;
