//! MCP configuration, tool, and connection-state types.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::McpClient;

/// Default protocol version offered at `initialize` time.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// A registered tool-server, as created/updated via the management API and
/// cached in memory keyed by device + server name. Durable storage belongs
/// to the external database collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub url: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: McpCapabilities,
    /// Extra HTTP headers sent on every request (e.g. auth tokens).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-call budget in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct McpCapabilities {
    #[serde(default)]
    pub tools: ToolCapability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCapability {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tool names executed without consulting the approval policy. The
    /// wildcard `"*"` approves every tool on the server.
    #[serde(default)]
    pub auto_approve: HashSet<String>,
}

impl Default for ToolCapability {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_approve: HashSet::new(),
        }
    }
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_enabled() -> bool {
    true
}

impl McpServerConfig {
    /// Whether a tool bypasses the approval hook.
    #[must_use]
    pub fn auto_approved(&self, tool_name: &str) -> bool {
        let set = &self.capabilities.tools.auto_approve;
        set.contains("*") || set.contains(tool_name)
    }
}

/// A tool advertised by a server's `tools/list` response. Cached on the
/// managed server so it remains advertised while the connection is down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
    /// Filled in by the manager; not part of the wire format.
    #[serde(default, skip_deserializing, rename = "serverName")]
    pub server_name: String,
}

/// Transient runtime state of one managed connection. Never persisted.
/// Survives health-check failures by moving to `Reconnecting` rather than
/// being deleted.
pub enum ConnectionState {
    Disconnected,
    Reconnecting {
        attempt: u32,
        next_attempt_at: Instant,
    },
    Connected {
        client: Arc<McpClient>,
        last_ping: Instant,
    },
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Connected { .. } => "connected",
        }
    }
}

/// Audit event kinds recorded by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpEventKind {
    ServerConnected,
    ServerReconnected,
    ServerDisconnected,
    ReconnectFailed,
    ServerRemoved,
    ToolCalled,
    ToolFailed,
}

impl McpEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerConnected => "server_connected",
            Self::ServerReconnected => "server_reconnected",
            Self::ServerDisconnected => "server_disconnected",
            Self::ReconnectFailed => "reconnect_failed",
            Self::ServerRemoved => "server_removed",
            Self::ToolCalled => "tool_called",
            Self::ToolFailed => "tool_failed",
        }
    }
}

/// One line in the bounded audit log served by `GET /{device}/mcp/logs`.
#[derive(Debug, Clone)]
pub struct McpEvent {
    pub timestamp: u64,
    pub device_id: String,
    pub server_name: String,
    pub kind: McpEventKind,
    pub detail: String,
}

/// A tool-use session record (management API bookkeeping).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpSession {
    pub session_id: String,
    pub device_id: String,
    pub server_name: String,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults_from_minimal_json() {
        let config: McpServerConfig =
            serde_json::from_value(json!({"url": "http://localhost:8080/mcp"})).unwrap();
        assert!(config.enabled);
        assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(config.timeout_ms, 30_000);
        assert!(config.capabilities.tools.enabled);
        assert!(!config.auto_approved("anything"));
    }

    #[test]
    fn wildcard_auto_approval() {
        let config: McpServerConfig = serde_json::from_value(json!({
            "url": "http://x",
            "capabilities": {"tools": {"enabled": true, "autoApprove": ["*"]}},
        }))
        .unwrap();
        assert!(config.auto_approved("whatever"));
    }

    #[test]
    fn named_auto_approval() {
        let config: McpServerConfig = serde_json::from_value(json!({
            "url": "http://x",
            "capabilities": {"tools": {"enabled": true, "autoApprove": ["read_file"]}},
        }))
        .unwrap();
        assert!(config.auto_approved("read_file"));
        assert!(!config.auto_approved("write_file"));
    }

    #[test]
    fn tool_deserializes_wire_shape() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}},
        }))
        .unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.server_name.is_empty());
    }
}
