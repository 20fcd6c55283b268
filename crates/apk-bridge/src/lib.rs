//! On-device download registry and install flow behind the Double WebView
//! shell, plus the `window.Android` bridge that drives it from web content.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod downloader;
pub mod error;
pub mod handlers;
pub mod installer;
pub mod permission;
pub mod platform;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod update;

pub use config::BridgeConfig;
pub use downloader::{DownloadEngine, DownloadOutcome};
pub use error::{BridgeError, Result};
pub use installer::{InstallLauncher, InstallOutcome};
pub use permission::{ConfirmationRequest, Decision, PermissionFlow, PromptReceiver};
pub use platform::{IntentRequest, Platform, RecordingPlatform};
pub use protocol::{BridgeEvent, BridgeRequest, BridgeResponse, Envelope};
pub use record::{ArtifactRecord, ArtifactStatus};
pub use registry::Registry;
pub use router::{HostRouter, ScriptSink};
pub use state::BridgeState;
pub use store::{FileStore, KvStore, MemoryStore};
pub use update::{UpdateInfo, UpdateService};

/// Where hosts mount [`create_router`]. The injected script posts to
/// `<this>/message`.
pub const BRIDGE_BASE_PATH: &str = "/api/bridge";

pub fn create_router(state: BridgeState) -> Router {
    Router::new()
        .route("/message", post(handlers::message_handler))
        .route("/invoke", post(handlers::invoke_handler))
        .route("/events", get(handlers::events_handler))
        .route("/records", get(handlers::records_handler))
        .route("/records/{id}", get(handlers::record_handler))
        .route("/update", get(handlers::update_handler))
        .route("/update/check", post(handlers::update_check_handler))
        .route("/update/dismiss", post(handlers::update_dismiss_handler))
        .route("/bridge.js", get(handlers::bridge_script_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
