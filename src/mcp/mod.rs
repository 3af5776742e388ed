//! MCP tool-server manager.
//!
//! Maintains, per device, zero or more remote tool-server connections and
//! the machinery around them:
//!
//! - **Registration** (`upsert_server`) — connection failure at registration
//!   time is non-fatal: the config is kept and the server becomes eligible
//!   for scheduled reconnection.
//! - **Health loop** ([`McpManager::tick`]) — pings every connected server
//!   on a fixed cadence; a failed ping is the only way "silent" connection
//!   death is detected, since the HTTP transport gives no disconnect event.
//! - **Reconnection** — exponential backoff `min(base × 2^attempt, max)`
//!   (30 s, 60 s, 120 s, 240 s, 480 s, 480 s, …) with no terminal give-up
//!   state; the counter resets on success. The state machine is explicit
//!   (`Disconnected → Reconnecting{attempt} → Connected`) with a
//!   scheduled-wake timestamp, and `tick` takes its `Instant` from the
//!   caller so the schedule is testable without real timers.
//! - **Tool invocation** (`call_tool`) — inline reconnect before giving up,
//!   approval policy, usage counters, audit log; connection-class execution
//!   errors re-enter the reconnect path and the caller is told to retry.
//! - **Prompt preamble** (`prompt_preamble`) — the tool-advertisement text
//!   the broker prepends to outgoing chat commands.

pub mod approval;
pub mod client;
pub mod types;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::McpConfig;
use crate::error::ApiError;
use approval::{AlwaysApprove, ToolApprovalPolicy};
use client::{McpClient, McpClientError};
use types::{ConnectionState, McpEvent, McpEventKind, McpServerConfig, McpSession, Tool};

/// Retry delay for `attempt` consecutive failures: `min(base × 2^attempt, max)`.
#[must_use]
pub fn reconnect_delay(base_secs: u64, max_secs: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(base_secs.saturating_mul(factor).min(max_secs))
}

/// A tool call requested by the device's model inside its reply text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    pub arguments: Value,
}

struct ManagedServer {
    config: McpServerConfig,
    state: ConnectionState,
    /// Last-known tools, retained while disconnected so the prompt preamble
    /// can still advertise them. Refreshed on every successful connect.
    tools: Vec<Tool>,
}

type ServerKey = (String, String);

/// Shared manager handle.
#[derive(Clone)]
pub struct McpManager {
    config: McpConfig,
    servers: Arc<RwLock<HashMap<ServerKey, ManagedServer>>>,
    usage: Arc<Mutex<HashMap<(String, String, String), u64>>>,
    events: Arc<Mutex<VecDeque<McpEvent>>>,
    sessions: Arc<Mutex<HashMap<String, McpSession>>>,
    approval: Arc<dyn ToolApprovalPolicy>,
}

impl McpManager {
    #[must_use]
    pub fn new(config: McpConfig) -> Self {
        Self::with_approval(config, Arc::new(AlwaysApprove))
    }

    #[must_use]
    pub fn with_approval(config: McpConfig, approval: Arc<dyn ToolApprovalPolicy>) -> Self {
        Self {
            config,
            servers: Arc::new(RwLock::new(HashMap::new())),
            usage: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(VecDeque::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            approval,
        }
    }

    fn key(device_id: &str, name: &str) -> ServerKey {
        (device_id.to_string(), name.to_string())
    }

    // ─── Registration and lifecycle ──────────────────────────────────────────

    /// Create or update a server registration. If `enabled`, a connection is
    /// attempted immediately; failure is non-fatal — the server is left
    /// disconnected and scheduled for reconnection.
    pub async fn upsert_server(
        &self,
        device_id: &str,
        name: &str,
        config: McpServerConfig,
    ) -> Result<Value, ApiError> {
        if config.url.trim().is_empty() {
            return Err(ApiError::Validation(
                "MCP server URL must not be empty".to_string(),
            ));
        }

        let enabled = config.enabled;
        let old_client = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .entry(Self::key(device_id, name))
                .or_insert_with(|| ManagedServer {
                    config: config.clone(),
                    state: ConnectionState::Disconnected,
                    tools: Vec::new(),
                });
            let old_client = match &entry.state {
                ConnectionState::Connected { client, .. } => Some(Arc::clone(client)),
                _ => None,
            };
            entry.config = config;
            entry.state = ConnectionState::Disconnected;
            old_client
        };
        if let Some(client) = old_client {
            client.close().await;
        }

        if enabled {
            if let Err(e) = self.try_connect(device_id, name).await {
                warn!(
                    device_id = %device_id,
                    server = %name,
                    "MCP server registered but initial connection failed: {e}"
                );
                self.schedule_reconnect(device_id, name, 0, Instant::now())
                    .await;
            }
        }

        self.server_status(device_id, name)
            .await
            .ok_or_else(|| ApiError::Internal("Server vanished during registration".to_string()))
    }

    /// Remove a registration entirely, closing any live connection.
    pub async fn remove_server(&self, device_id: &str, name: &str) -> Result<(), ApiError> {
        let removed = self
            .servers
            .write()
            .await
            .remove(&Self::key(device_id, name));
        let Some(server) = removed else {
            return Err(ApiError::NotFound(format!("Unknown MCP server '{name}'")));
        };
        if let ConnectionState::Connected { client, .. } = server.state {
            client.close().await;
        }
        self.record_event(device_id, name, McpEventKind::ServerRemoved, String::new())
            .await;
        Ok(())
    }

    /// Flip a server's enabled flag. Disabling closes the connection;
    /// enabling attempts one (failure non-fatal, as at registration).
    pub async fn toggle_server(&self, device_id: &str, name: &str) -> Result<bool, ApiError> {
        let (enabled, old_client) = {
            let mut servers = self.servers.write().await;
            let Some(server) = servers.get_mut(&Self::key(device_id, name)) else {
                return Err(ApiError::NotFound(format!("Unknown MCP server '{name}'")));
            };
            server.config.enabled = !server.config.enabled;
            let old_client = match &server.state {
                ConnectionState::Connected { client, .. } => Some(Arc::clone(client)),
                _ => None,
            };
            if !server.config.enabled {
                server.state = ConnectionState::Disconnected;
            }
            (server.config.enabled, old_client)
        };

        if enabled {
            if let Err(e) = self.try_connect(device_id, name).await {
                warn!(device_id = %device_id, server = %name, "Enable failed to connect: {e}");
                self.schedule_reconnect(device_id, name, 0, Instant::now())
                    .await;
            }
        } else if let Some(client) = old_client {
            client.close().await;
        }
        Ok(enabled)
    }

    /// One connection attempt: build client, `initialize`, fetch tools,
    /// transition to `Connected`. The attempt counter resets implicitly —
    /// `Connected` carries none.
    async fn try_connect(&self, device_id: &str, name: &str) -> Result<usize, McpClientError> {
        let key = Self::key(device_id, name);
        let (config, was_retrying) = {
            let servers = self.servers.read().await;
            let Some(server) = servers.get(&key) else {
                return Err(McpClientError::Protocol("Server was removed".to_string()));
            };
            (
                server.config.clone(),
                matches!(server.state, ConnectionState::Reconnecting { .. }),
            )
        };

        let client = McpClient::new(&config)?;
        let init = client.initialize().await?;
        let mut tools = if config.capabilities.tools.enabled {
            client.list_tools().await?
        } else {
            Vec::new()
        };
        for tool in &mut tools {
            tool.server_name = name.to_string();
        }
        let tool_count = tools.len();
        let server_info = init["serverInfo"]["name"].as_str().unwrap_or("?").to_string();

        {
            let mut servers = self.servers.write().await;
            let Some(server) = servers.get_mut(&key) else {
                return Err(McpClientError::Protocol(
                    "Server was removed during connect".to_string(),
                ));
            };
            server.state = ConnectionState::Connected {
                client: Arc::new(client),
                last_ping: Instant::now(),
            };
            server.tools = tools;
        }

        let kind = if was_retrying {
            McpEventKind::ServerReconnected
        } else {
            McpEventKind::ServerConnected
        };
        info!(
            device_id = %device_id,
            server = %name,
            server_info = %server_info,
            tool_count,
            "MCP server connected"
        );
        self.record_event(device_id, name, kind, format!("{server_info}, {tool_count} tools"))
            .await;
        Ok(tool_count)
    }

    /// Move a server into `Reconnecting` with the delay for `attempt`.
    async fn schedule_reconnect(&self, device_id: &str, name: &str, attempt: u32, now: Instant) {
        let delay = reconnect_delay(
            self.config.reconnect_base_secs,
            self.config.reconnect_max_secs,
            attempt,
        );
        let mut servers = self.servers.write().await;
        if let Some(server) = servers.get_mut(&Self::key(device_id, name)) {
            server.state = ConnectionState::Reconnecting {
                attempt,
                next_attempt_at: now + delay,
            };
            debug!(
                device_id = %device_id,
                server = %name,
                attempt,
                delay_secs = delay.as_secs(),
                "Reconnect scheduled"
            );
        }
    }

    /// Health-check failure or connection-class tool error: transition to
    /// `Reconnecting` from attempt 0. Cached tools stay advertised.
    async fn mark_disconnected(&self, device_id: &str, name: &str, now: Instant, reason: &str) {
        warn!(device_id = %device_id, server = %name, "MCP server disconnected: {reason}");
        self.record_event(
            device_id,
            name,
            McpEventKind::ServerDisconnected,
            reason.to_string(),
        )
        .await;
        self.schedule_reconnect(device_id, name, 0, now).await;
    }

    // ─── Health and reconnect loop ───────────────────────────────────────────

    /// One maintenance pass. For every enabled server: ping it if it has
    /// been `health_interval_secs` since the last ping, or retry it if its
    /// reconnect wake time has passed. Runs on a short interval from `main`;
    /// `now` is injected so tests can drive the schedule directly.
    pub async fn tick(&self, now: Instant) {
        enum Action {
            Ping(Arc<McpClient>),
            Reconnect { attempt: u32 },
        }

        let health_interval = Duration::from_secs(self.config.health_interval_secs);
        let mut actions: Vec<(ServerKey, Action)> = Vec::new();
        {
            let servers = self.servers.read().await;
            for (key, server) in servers.iter() {
                if !server.config.enabled {
                    continue;
                }
                match &server.state {
                    ConnectionState::Connected { client, last_ping }
                        if now.duration_since(*last_ping) >= health_interval =>
                    {
                        actions.push((key.clone(), Action::Ping(Arc::clone(client))));
                    }
                    ConnectionState::Reconnecting {
                        attempt,
                        next_attempt_at,
                    } if *next_attempt_at <= now => {
                        actions.push((key.clone(), Action::Reconnect { attempt: *attempt }));
                    }
                    _ => {}
                }
            }
        }

        for ((device_id, name), action) in actions {
            match action {
                Action::Ping(client) => match client.ping().await {
                    Ok(()) => {
                        let mut servers = self.servers.write().await;
                        if let Some(server) = servers.get_mut(&Self::key(&device_id, &name)) {
                            if let ConnectionState::Connected { last_ping, .. } = &mut server.state
                            {
                                *last_ping = now;
                            }
                        }
                    }
                    Err(e) => {
                        self.mark_disconnected(
                            &device_id,
                            &name,
                            now,
                            &format!("health check failed: {e}"),
                        )
                        .await;
                    }
                },
                Action::Reconnect { attempt } => {
                    if let Err(e) = self.try_connect(&device_id, &name).await {
                        let next = attempt.saturating_add(1);
                        self.record_event(
                            &device_id,
                            &name,
                            McpEventKind::ReconnectFailed,
                            format!("attempt {next}: {e}"),
                        )
                        .await;
                        self.schedule_reconnect(&device_id, &name, next, now).await;
                    }
                }
            }
        }
    }

    // ─── Tool invocation ─────────────────────────────────────────────────────

    /// Execute a tool on a registered server.
    ///
    /// If the server is not currently connected, one inline reconnect is
    /// attempted first — the caller (an in-progress chat turn) has already
    /// committed to using the tool.
    pub async fn call_tool(
        &self,
        device_id: &str,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, ApiError> {
        let key = Self::key(device_id, server_name);
        let (config, mut client) = {
            let servers = self.servers.read().await;
            let Some(server) = servers.get(&key) else {
                return Err(ApiError::NotFound(format!(
                    "Unknown MCP server '{server_name}'"
                )));
            };
            let client = match &server.state {
                ConnectionState::Connected { client, .. } => Some(Arc::clone(client)),
                _ => None,
            };
            (server.config.clone(), client)
        };

        if !config.enabled {
            return Err(ApiError::ServiceUnavailable(format!(
                "MCP server '{server_name}' is disabled"
            )));
        }

        if client.is_none() {
            // Inline reconnect before giving up
            if let Err(e) = self.try_connect(device_id, server_name).await {
                return Err(ApiError::ServiceUnavailable(format!(
                    "MCP server '{server_name}' is not connected: {e}"
                )));
            }
            let servers = self.servers.read().await;
            client = servers.get(&key).and_then(|s| match &s.state {
                ConnectionState::Connected { client, .. } => Some(Arc::clone(client)),
                _ => None,
            });
        }
        let Some(client) = client else {
            return Err(ApiError::ServiceUnavailable(format!(
                "MCP server '{server_name}' is not connected"
            )));
        };

        if !config.auto_approved(tool_name)
            && !self
                .approval
                .approve(device_id, server_name, tool_name, &arguments)
                .await
        {
            return Err(ApiError::ToolNotApproved(tool_name.to_string()));
        }

        match client.call_tool(tool_name, arguments).await {
            Ok(result) => {
                {
                    let mut usage = self.usage.lock().await;
                    *usage
                        .entry((
                            device_id.to_string(),
                            server_name.to_string(),
                            tool_name.to_string(),
                        ))
                        .or_insert(0) += 1;
                }
                info!(
                    device_id = %device_id,
                    server = %server_name,
                    tool = %tool_name,
                    "Tool executed"
                );
                self.record_event(
                    device_id,
                    server_name,
                    McpEventKind::ToolCalled,
                    tool_name.to_string(),
                )
                .await;
                Ok(result)
            }
            Err(e) if e.is_connection_error() => {
                self.record_event(
                    device_id,
                    server_name,
                    McpEventKind::ToolFailed,
                    format!("{tool_name}: {e}"),
                )
                .await;
                self.mark_disconnected(
                    device_id,
                    server_name,
                    Instant::now(),
                    &format!("tool call failed: {e}"),
                )
                .await;
                Err(ApiError::ServiceUnavailable(format!(
                    "Connection to MCP server '{server_name}' was lost, retry shortly"
                )))
            }
            Err(e) => {
                self.record_event(
                    device_id,
                    server_name,
                    McpEventKind::ToolFailed,
                    format!("{tool_name}: {e}"),
                )
                .await;
                Err(ApiError::Internal(format!("Tool '{tool_name}' failed: {e}")))
            }
        }
    }

    // ─── Prompt preamble ─────────────────────────────────────────────────────

    /// Tool-advertisement text prepended to outgoing chat messages. Covers
    /// every enabled server with cached tools — including servers that are
    /// temporarily disconnected (stale-tool advertisement). Empty when no
    /// tools are available.
    pub async fn prompt_preamble(&self, device_id: &str) -> String {
        let servers = self.servers.read().await;
        let mut listings = Vec::new();
        for ((dev, name), server) in servers.iter() {
            if dev != device_id
                || !server.config.enabled
                || !server.config.capabilities.tools.enabled
                || server.tools.is_empty()
            {
                continue;
            }
            for tool in &server.tools {
                let approved = if server.config.auto_approved(&tool.name) {
                    "yes"
                } else {
                    "no"
                };
                listings.push(format!(
                    "- {} (server: {name})\n  {}\n  Input schema: {}\n  Auto-approved: {approved}",
                    tool.name,
                    tool.description,
                    serde_json::to_string(&tool.input_schema).unwrap_or_else(|_| "{}".into()),
                ));
            }
        }
        drop(servers);

        if listings.is_empty() {
            return String::new();
        }

        let mut out = String::from("You have access to the following external tools:\n\n");
        out.push_str(&listings.join("\n"));
        out.push_str(
            "\n\nTo use a tool, reply with exactly one JSON object of the form \
             {\"server\": \"<server name>\", \"tool\": \"<tool name>\", \"arguments\": { ... }} \
             and nothing else. Never invent tools that are not listed above. \
             Do not generate user-interface elements and do not fall back to \
             external search; if no tool fits, answer directly.\n",
        );
        out
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    /// Status objects for every server registered to a device.
    pub async fn list_servers(&self, device_id: &str) -> Vec<Value> {
        let servers = self.servers.read().await;
        let mut list: Vec<Value> = servers
            .iter()
            .filter(|((dev, _), _)| dev == device_id)
            .map(|((_, name), server)| Self::status_json(name, server))
            .collect();
        list.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        list
    }

    /// Status for a single server, if registered.
    pub async fn server_status(&self, device_id: &str, name: &str) -> Option<Value> {
        let servers = self.servers.read().await;
        servers
            .get(&Self::key(device_id, name))
            .map(|server| Self::status_json(name, server))
    }

    fn status_json(name: &str, server: &ManagedServer) -> Value {
        let reconnect_attempts = match server.state {
            ConnectionState::Reconnecting { attempt, .. } => attempt,
            _ => 0,
        };
        json!({
            "name": name,
            "url": server.config.url,
            "enabled": server.config.enabled,
            "status": server.state.as_str(),
            "toolCount": server.tools.len(),
            "reconnectAttempts": reconnect_attempts,
            "protocolVersion": server.config.protocol_version,
        })
    }

    /// Cached tools for one server.
    pub async fn server_tools(&self, device_id: &str, name: &str) -> Result<Vec<Tool>, ApiError> {
        let servers = self.servers.read().await;
        servers
            .get(&Self::key(device_id, name))
            .map(|s| s.tools.clone())
            .ok_or_else(|| ApiError::NotFound(format!("Unknown MCP server '{name}'")))
    }

    /// Number of connected servers for a device (status endpoint).
    pub async fn connected_count(&self, device_id: &str) -> usize {
        let servers = self.servers.read().await;
        servers
            .iter()
            .filter(|((dev, _), s)| dev == device_id && s.state.is_connected())
            .count()
    }

    /// Recent audit events for a device, newest last.
    pub async fn logs(&self, device_id: &str) -> Vec<Value> {
        let events = self.events.lock().await;
        events
            .iter()
            .filter(|e| e.device_id == device_id)
            .map(|e| {
                json!({
                    "timestamp": e.timestamp,
                    "server": e.server_name,
                    "event": e.kind.as_str(),
                    "detail": e.detail,
                })
            })
            .collect()
    }

    /// Per-tool usage counters for a device.
    pub async fn usage_stats(&self, device_id: &str) -> Value {
        let usage = self.usage.lock().await;
        let mut out = serde_json::Map::new();
        for ((dev, server, tool), count) in usage.iter() {
            if dev == device_id {
                out.insert(format!("{server}/{tool}"), json!(count));
            }
        }
        Value::Object(out)
    }

    async fn record_event(&self, device_id: &str, server_name: &str, kind: McpEventKind, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= self.config.log_buffer {
            events.pop_front();
        }
        events.push_back(McpEvent {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            device_id: device_id.to_string(),
            server_name: server_name.to_string(),
            kind,
            detail,
        });
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    /// Open a tool-use session record against a registered server.
    pub async fn create_session(
        &self,
        device_id: &str,
        server_name: &str,
    ) -> Result<McpSession, ApiError> {
        if !self
            .servers
            .read()
            .await
            .contains_key(&Self::key(device_id, server_name))
        {
            return Err(ApiError::NotFound(format!(
                "Unknown MCP server '{server_name}'"
            )));
        }
        let session = McpSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            server_name: server_name.to_string(),
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        self.sessions
            .lock()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Session records for a device.
    pub async fn list_sessions(&self, device_id: &str) -> Vec<McpSession> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<McpSession> = sessions
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Close a session record. Returns whether it existed.
    pub async fn close_session(&self, device_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(session_id)
            .is_some_and(|s| s.device_id == device_id)
        {
            sessions.remove(session_id);
            return true;
        }
        false
    }

    /// Close every live connection (graceful shutdown).
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<McpClient>> = {
            let servers = self.servers.read().await;
            servers
                .values()
                .filter_map(|s| match &s.state {
                    ConnectionState::Connected { client, .. } => Some(Arc::clone(client)),
                    _ => None,
                })
                .collect()
        };
        for client in clients {
            client.close().await;
        }
    }
}

// ─── Tool-call envelope parsing ──────────────────────────────────────────────

/// Extract a `{"server","tool","arguments"}` envelope from model reply text.
///
/// The model is instructed to reply with the bare object, but real models
/// wrap it in code fences or surrounding prose, so three passes are tried:
/// the whole text, fenced ```json blocks, and any embedded JSON object.
#[must_use]
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    if let Some(call) = try_parse_envelope(text.trim()) {
        return Some(call);
    }

    // Fenced code blocks
    for fence in ["```json", "```"] {
        let mut rest = text;
        while let Some(start) = rest.find(fence) {
            let body = &rest[start + fence.len()..];
            if let Some(end) = body.find("```") {
                if let Some(call) = try_parse_envelope(body[..end].trim()) {
                    return Some(call);
                }
                rest = &body[end + 3..];
            } else {
                break;
            }
        }
    }

    // Embedded object anywhere in the text
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(text, i) {
                if let Some(call) = try_parse_envelope(&text[i..=end]) {
                    return Some(call);
                }
            }
        }
        i += 1;
    }
    None
}

fn try_parse_envelope(s: &str) -> Option<ToolCall> {
    let v: Value = serde_json::from_str(s).ok()?;
    let server = v.get("server")?.as_str()?.to_string();
    let tool = v.get("tool")?.as_str()?.to_string();
    let arguments = v.get("arguments").cloned().unwrap_or_else(|| json!({}));
    Some(ToolCall {
        server,
        tool,
        arguments,
    })
}

/// Index of the `}` matching the `{` at `start`, string-literal aware.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
