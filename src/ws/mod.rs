//! Device WebSocket transport.
//!
//! ## Connection lifecycle
//!
//! 1. The device connects to `GET /ws?device_id=<id>`. The id format is
//!    validated before the upgrade completes; a duplicate id evicts the
//!    stale session and replaces it.
//! 2. All messages are JSON objects with a `"type"` field. Command replies
//!    carry the `requestId` they correlate with; the broker decides whether
//!    a reply is applied or discarded.
//! 3. On disconnect, the session entry is removed and every pending request
//!    for the device is drained so HTTP callers degrade immediately.
//!
//! ## Message types (device → server)
//!
//! | Type               | Fields                               | Effect                         |
//! |--------------------|--------------------------------------|--------------------------------|
//! | `response`         | `requestId`, `response`, `model`     | resolves a chat request        |
//! | `tts_response`     | `requestId`, `audioData`, `audioFormat` | resolves a speech request   |
//! | `message_received` | `requestId`                          | delivery ack, logged only      |
//! | `tts_received`     | `requestId`                          | delivery ack, logged only      |
//! | `error`            | `requestId`, `error`                 | resolves a chat request as error |
//! | `tts_error`        | `requestId`, `error`                 | resolves a speech request as error |
//! | `ping`             | `timestamp`                          | heartbeat; server replies `pong` |
//! | `pong`             | `timestamp`                          | heartbeat timestamp update     |
//!
//! Heartbeats are liveness only and never correlated with pending requests.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::protocol::DeviceReply;
use crate::registry::is_valid_device_id;
use crate::state::AppState;

/// Query parameters for the device WebSocket upgrade.
#[derive(Deserialize)]
pub struct WsQuery {
    pub device_id: String,
}

/// `GET /ws?device_id=<id>` — device socket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_valid_device_id(&query.device_id) {
        return (StatusCode::BAD_REQUEST, "Invalid device id").into_response();
    }

    let device_id = query.device_id.clone();
    info!(device_id = %device_id, "Device connecting...");
    ws.on_upgrade(move |socket| {
        handle_device_ws(socket, state, device_id.clone())
            .instrument(info_span!("device_ws", device_id = %device_id))
    })
}

/// Handle a registered device's WebSocket connection.
async fn handle_device_ws(socket: axum::extract::ws::WebSocket, state: AppState, device_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (device_tx, mut device_rx) = mpsc::channel::<Value>(256);

    let mut shutdown_rx = state.registry.register(&device_id, device_tx.clone()).await;

    // Ack the registration so the device knows routing is live
    let ack = json!({"type": "register_ack", "deviceId": &device_id});
    let _ = ws_sink
        .send(axum::extract::ws::Message::Text(
            serde_json::to_string(&ack).expect("Value serializes").into(),
        ))
        .await;

    // Forward queued payloads to the WS sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = device_rx.recv().await {
            let text = serde_json::to_string(&msg).expect("Value serializes");
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Process messages from the device
    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = shutdown_rx.changed() => {
                info!("Device handler shutting down (replaced by new connection)");
                break;
            }
        };
        match msg {
            axum::extract::ws::Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                dispatch_device_message(&state, &device_id, &device_tx, parsed).await;
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {} // Binary/Ping/Pong frames — ignore
        }
    }

    // Device gone (or replaced): clean up only our own session, then drain
    // pending requests so waiters don't run out their full timeout.
    let removed = state.registry.unregister(&device_id, &device_tx).await;
    if removed {
        state.broker.fail_device(&device_id).await;
    }
    send_task.abort();
}

/// Route one parsed device message.
async fn dispatch_device_message(
    state: &AppState,
    device_id: &str,
    device_tx: &mpsc::Sender<Value>,
    msg: Value,
) {
    let msg_type = msg["type"].as_str().unwrap_or("");
    match msg_type {
        "response" => {
            let Some(request_id) = msg["requestId"].as_str() else {
                warn!("response without requestId");
                return;
            };
            let reply = DeviceReply::Chat {
                text: msg["response"].as_str().unwrap_or("").to_string(),
                model: msg["model"].as_str().map(ToString::to_string),
            };
            state.broker.resolve(device_id, request_id, reply).await;
        }
        "tts_response" => {
            let Some(request_id) = msg["requestId"].as_str() else {
                warn!("tts_response without requestId");
                return;
            };
            // Missing or undecodable audio resolves as an empty payload; the
            // handler maps that to NoAudioData.
            let audio = msg["audioData"]
                .as_str()
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
                .unwrap_or_default();
            let reply = DeviceReply::Speech {
                audio,
                format: msg["audioFormat"].as_str().map(ToString::to_string),
            };
            state.broker.resolve(device_id, request_id, reply).await;
        }
        "error" | "tts_error" => {
            let Some(request_id) = msg["requestId"].as_str() else {
                warn!(msg_type, "error event without requestId");
                return;
            };
            let reply = DeviceReply::Error {
                message: msg["error"].as_str().unwrap_or("unknown error").to_string(),
            };
            state.broker.resolve(device_id, request_id, reply).await;
        }
        "message_received" | "tts_received" => {
            debug!(
                request_id = msg["requestId"].as_str().unwrap_or(""),
                msg_type, "Delivery ack"
            );
        }
        "ping" => {
            state.registry.heartbeat(device_id).await;
            let _ = device_tx
                .send(json!({"type": "pong", "timestamp": msg["timestamp"]}))
                .await;
        }
        "pong" => {
            state.registry.heartbeat(device_id).await;
        }
        _ => {
            warn!(msg_type, "Unknown message from device");
        }
    }
}
