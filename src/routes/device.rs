//! Device management endpoints: health, PIN lifecycle, info, status, sync.
//!
//! PIN management delegates to the registry's credential store. Every
//! device-scoped route passes through the same PIN gate as the OpenAI
//! surface — a device without a PIN accepts unauthenticated calls.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::broker::RequestKind;
use crate::error::ApiError;
use crate::state::AppState;

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

/// `GET /health` — liveness probe, no authentication.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "devices_connected": state.registry.connected_count().await,
    }))
}

/// Body for `enable-pin` and `change-pin`.
#[derive(Deserialize)]
struct PinBody {
    pin: String,
}

/// `POST /{device_id}/enable-pin` — set a 6-digit PIN. When the device
/// already has a PIN, the caller must present it.
pub async fn enable_pin(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let body: PinBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))?;
    state.registry.set_pin(&device_id, &body.pin).await?;
    Ok(Json(json!({"deviceId": device_id, "pinEnabled": true})))
}

/// `POST /{device_id}/disable-pin` — remove the PIN (requires the current one).
pub async fn disable_pin(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    state.registry.clear_pin(&device_id).await;
    Ok(Json(json!({"deviceId": device_id, "pinEnabled": false})))
}

/// `POST /{device_id}/change-pin` — replace the PIN (requires the current one).
pub async fn change_pin(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let body: PinBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))?;
    state.registry.set_pin(&device_id, &body.pin).await?;
    Ok(Json(json!({"deviceId": device_id, "pinEnabled": true})))
}

/// `GET /{device_id}/info` — device record and connection summary.
pub async fn info(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let record = state.registry.record(&device_id).await;
    let connected = state.registry.is_connected(&device_id).await;
    Ok(Json(json!({
        "deviceId": device_id,
        "connected": connected,
        "pinEnabled": record.as_ref().is_some_and(|r| r.pin_hash.is_some()),
        "firstSeen": record.as_ref().map(|r| r.first_seen),
        "lastConnected": record.as_ref().and_then(|r| r.last_connected),
        "lastSynced": record.as_ref().and_then(|r| r.last_synced),
        "server": {
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.start_time.elapsed().as_secs(),
        },
    })))
}

/// `GET /{device_id}/status` — live connection, pending requests, MCP summary.
pub async fn status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let session = state.registry.session_info(&device_id).await;
    let inflight = state.broker.inflight_kinds(&device_id).await;
    Ok(Json(json!({
        "deviceId": device_id,
        "connected": session.is_some(),
        "connectedSecs": session.as_ref().map(|s| s.connected_secs),
        "lastHeartbeatAgoMs": session.as_ref().map(|s| s.last_heartbeat_ago_ms),
        "pending": {
            "chat": inflight.contains(&RequestKind::Chat),
            "speech": inflight.contains(&RequestKind::Speech),
        },
        "mcp": {
            "servers": state.mcp.list_servers(&device_id).await.len(),
            "connected": state.mcp.connected_count(&device_id).await,
        },
    })))
}

/// `POST /{device_id}/sync` — refresh the device record timestamp.
pub async fn sync(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let record = state.registry.mark_synced(&device_id).await;
    Ok(Json(json!({
        "deviceId": device_id,
        "synced": true,
        "timestamp": record.last_synced,
        "pinEnabled": record.pin_hash.is_some(),
    })))
}
