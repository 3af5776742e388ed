//! MCP management endpoints, device-scoped except for the template listing.
//!
//! All handlers are thin wrappers over [`McpManager`]; the PIN gate matches
//! the rest of the device-scoped surface.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::mcp::types::McpServerConfig;
use crate::state::AppState;

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

/// `GET /{device_id}/mcp/servers` — list registered servers with status.
pub async fn list_servers(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    Ok(Json(json!({
        "servers": state.mcp.list_servers(&device_id).await,
    })))
}

/// Body for server registration: a name plus the config fields.
#[derive(Deserialize)]
struct UpsertServerBody {
    name: String,
    #[serde(flatten)]
    config: McpServerConfig,
}

/// `POST /{device_id}/mcp/servers` — create or update a server registration.
pub async fn upsert_server(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let body: UpsertServerBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation(
            "server name must not be empty".to_string(),
        ));
    }
    let status = state
        .mcp
        .upsert_server(&device_id, &body.name, body.config)
        .await?;
    Ok(Json(status))
}

/// `GET /{device_id}/mcp/servers/{name}` — one server's status.
pub async fn get_server(
    State(state): State<AppState>,
    Path((device_id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    state
        .mcp
        .server_status(&device_id, &name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown MCP server '{name}'")))
}

/// `DELETE /{device_id}/mcp/servers/{name}` — remove a registration.
pub async fn remove_server(
    State(state): State<AppState>,
    Path((device_id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    state.mcp.remove_server(&device_id, &name).await?;
    Ok(Json(json!({"removed": name})))
}

/// `POST /{device_id}/mcp/servers/{name}/toggle` — enable/disable.
pub async fn toggle_server(
    State(state): State<AppState>,
    Path((device_id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let enabled = state.mcp.toggle_server(&device_id, &name).await?;
    Ok(Json(json!({"name": name, "enabled": enabled})))
}

/// `GET /{device_id}/mcp/servers/{name}/tools` — cached tool list.
pub async fn server_tools(
    State(state): State<AppState>,
    Path((device_id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let tools = state.mcp.server_tools(&device_id, &name).await?;
    Ok(Json(json!({"tools": tools})))
}

/// Body for a direct tool invocation.
#[derive(Deserialize, Default)]
struct CallToolBody {
    #[serde(default)]
    arguments: Value,
}

/// `POST /{device_id}/mcp/servers/{name}/tools/{tool}/call` — execute a tool.
pub async fn call_tool(
    State(state): State<AppState>,
    Path((device_id, name, tool)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let body: CallToolBody = if body.is_empty() {
        CallToolBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))?
    };
    let arguments = if body.arguments.is_null() {
        json!({})
    } else {
        body.arguments
    };
    let result = state
        .mcp
        .call_tool(&device_id, &name, &tool, arguments)
        .await?;
    Ok(Json(json!({"result": result})))
}

/// `GET /{device_id}/mcp/logs` — recent audit events and usage counters.
pub async fn logs(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    Ok(Json(json!({
        "logs": state.mcp.logs(&device_id).await,
        "usage": state.mcp.usage_stats(&device_id).await,
    })))
}

/// Body for session creation.
#[derive(Deserialize)]
struct CreateSessionBody {
    server: String,
}

/// `POST /{device_id}/mcp/sessions` — open a tool-use session record.
pub async fn create_session(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let body: CreateSessionBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))?;
    let session = state.mcp.create_session(&device_id, &body.server).await?;
    Ok(Json(serde_json::to_value(session).unwrap_or_default()))
}

/// `GET /{device_id}/mcp/sessions` — list session records.
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let sessions = state.mcp.list_sessions(&device_id).await;
    Ok(Json(json!({"sessions": sessions})))
}

/// `DELETE /{device_id}/mcp/sessions/{id}` — close a session record.
pub async fn close_session(
    State(state): State<AppState>,
    Path((device_id, session_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    if state.mcp.close_session(&device_id, &session_id).await {
        Ok(Json(json!({"closed": session_id})))
    } else {
        Err(ApiError::NotFound(format!(
            "Unknown MCP session '{session_id}'"
        )))
    }
}

/// `GET /mcp/templates` — static server presets, no device scope.
pub async fn templates() -> Json<Value> {
    Json(json!({
        "templates": [
            {
                "name": "filesystem",
                "description": "Read and list files on the tool-server host",
                "url": "http://localhost:3001/mcp",
                "capabilities": {
                    "tools": {"enabled": true, "autoApprove": ["read_file", "list_directory"]},
                },
            },
            {
                "name": "memory",
                "description": "Persistent key-value memory for the assistant",
                "url": "http://localhost:3002/mcp",
                "capabilities": {
                    "tools": {"enabled": true, "autoApprove": ["*"]},
                },
            },
            {
                "name": "fetch",
                "description": "Fetch and convert web pages to markdown",
                "url": "http://localhost:3003/mcp",
                "capabilities": {
                    "tools": {"enabled": true, "autoApprove": []},
                },
            },
        ],
    }))
}
