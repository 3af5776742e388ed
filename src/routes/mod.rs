//! REST API route handlers and router assembly.

pub mod device;
pub mod mcp;
pub mod openai;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::ws;

/// Build the full application router. Static segments (`/health`, `/ws`,
/// `/mcp/templates`) take priority over the `{device_id}` capture.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(device::health))
        .route("/ws", get(ws::ws_upgrade))
        .route("/mcp/templates", get(mcp::templates))
        // OpenAI-compatible surface
        .route(
            "/{device_id}/v1/chat/completions",
            post(openai::chat_completions),
        )
        .route("/{device_id}/v1/models", get(openai::list_models))
        .route("/{device_id}/v1/audio/speech", post(openai::create_speech))
        // Device management
        .route("/{device_id}/enable-pin", post(device::enable_pin))
        .route("/{device_id}/disable-pin", post(device::disable_pin))
        .route("/{device_id}/change-pin", post(device::change_pin))
        .route("/{device_id}/info", get(device::info))
        .route("/{device_id}/status", get(device::status))
        .route("/{device_id}/sync", post(device::sync))
        // MCP management
        .route(
            "/{device_id}/mcp/servers",
            get(mcp::list_servers).post(mcp::upsert_server),
        )
        .route(
            "/{device_id}/mcp/servers/{name}",
            get(mcp::get_server).delete(mcp::remove_server),
        )
        .route(
            "/{device_id}/mcp/servers/{name}/toggle",
            post(mcp::toggle_server),
        )
        .route(
            "/{device_id}/mcp/servers/{name}/tools",
            get(mcp::server_tools),
        )
        .route(
            "/{device_id}/mcp/servers/{name}/tools/{tool}/call",
            post(mcp::call_tool),
        )
        .route("/{device_id}/mcp/logs", get(mcp::logs))
        .route(
            "/{device_id}/mcp/sessions",
            get(mcp::list_sessions).post(mcp::create_session),
        )
        .route(
            "/{device_id}/mcp/sessions/{id}",
            delete(mcp::close_session),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
