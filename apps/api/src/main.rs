use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use call_orchestration_cell::models::CallOrchestrationConfig;
use call_orchestration_cell::services::{
    MeetingProvider, RealtimeMeetingClient, RealtimeSyncBridge, SupabaseCallStore,
    VideoCallSessionManager,
};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

#[tokio::main]
async fn main() {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Halcyon Clinic API server");

    // Load configuration
    let config = AppConfig::from_env();
    let orchestration_config = CallOrchestrationConfig::default();

    // Wire the orchestration core: store and provider are constructed once
    // here and injected, never reached through globals
    let store = Arc::new(SupabaseCallStore::new(SupabaseClient::new(&config)));
    let provider: Option<Arc<dyn MeetingProvider>> = match RealtimeMeetingClient::new(&config) {
        Ok(client) => Some(Arc::new(client)),
        Err(_) => {
            warn!("Video provider not configured - session creation will be rejected");
            None
        }
    };

    let manager = VideoCallSessionManager::new(store.clone(), provider, orchestration_config.clone());

    // Background tasks: change-feed bridge and session watchdog
    let bridge = Arc::new(RealtimeSyncBridge::new(
        store,
        manager.clone(),
        orchestration_config,
    ));
    tokio::spawn(bridge.run());
    tokio::spawn(manager.clone().run_watchdog());

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(manager)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .await
        .unwrap();
}
