use axum::{
    Json,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    BRIDGE_BASE_PATH,
    error::{BridgeError, Result},
    protocol::{BridgeResponse, Envelope, injection_script},
    record::ArtifactRecord,
    registry::RecordMap,
    state::BridgeState,
    update::UpdateInfo,
};

/// Fire-and-forget path used by the injected script when there is no native
/// message channel. The outcome arrives later as a callback on `/events`.
pub async fn message_handler(State(state): State<BridgeState>, body: String) -> StatusCode {
    let _ = state.router.handle_message(&body);
    StatusCode::ACCEPTED
}

pub async fn invoke_handler(
    State(state): State<BridgeState>,
    Json(envelope): Json<Envelope>,
) -> Json<BridgeResponse> {
    Json(state.router.invoke(envelope).await)
}

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<BridgeState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

// Scripts flow out; text frames coming back in are treated as bridge messages,
// so a WebView can use the socket for both directions.
async fn handle_events_socket(socket: WebSocket, state: BridgeState) {
    let mut scripts = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();
    info!("🔌 [Bridge] Page connected to event stream");

    loop {
        tokio::select! {
            script = scripts.recv() => match script {
                Ok(script) => {
                    if sender.send(Message::Text(script.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[Bridge] Event stream lagged, {skipped} callback(s) dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = state.router.handle_message(text.as_str());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("[Bridge] Event socket error: {err}");
                    break;
                }
            },
        }
    }
    info!("[Bridge] Page disconnected from event stream");
}

pub async fn records_handler(State(state): State<BridgeState>) -> Json<RecordMap> {
    Json(state.registry.all().await)
}

pub async fn record_handler(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactRecord>> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or(BridgeError::NotFound)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub current_version: String,
    pub update: Option<UpdateInfo>,
}

pub async fn update_handler(State(state): State<BridgeState>) -> Json<UpdateStatus> {
    Json(UpdateStatus {
        current_version: state.updates.app_version().to_string(),
        update: state.updates.pending(),
    })
}

pub async fn update_check_handler(State(state): State<BridgeState>) -> Json<UpdateStatus> {
    let update = match state.updates.check_for_update().await {
        Some(info) => Some(info),
        None => state.updates.pending(),
    };
    Json(UpdateStatus {
        current_version: state.updates.app_version().to_string(),
        update,
    })
}

pub async fn update_dismiss_handler(State(state): State<BridgeState>) -> StatusCode {
    state.updates.dismiss();
    StatusCode::NO_CONTENT
}

pub async fn bridge_script_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        injection_script(&format!("{BRIDGE_BASE_PATH}/message")),
    )
}
