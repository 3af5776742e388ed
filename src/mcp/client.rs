//! Minimal JSON-RPC 2.0 client for the Model Context Protocol.
//!
//! [`McpClient`] speaks the streamable-HTTP transport: every call is a POST
//! of a JSON-RPC request; the server answers either with a plain
//! `application/json` body or with a `text/event-stream` whose first
//! matching `message` event carries the response. The four-method contract
//! the manager relies on is `initialize`, `tools/list`, `tools/call`, and
//! `ping`, plus `close`.
//!
//! Transport status codes are mapped to [`McpClientError`] sub-reasons so
//! the manager can distinguish "wrong URL" from "server fell over":
//! 404 → endpoint not found, 405 → not an MCP endpoint, 500 → server-side
//! fault, connect/timeout → unreachable.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use super::types::{McpServerConfig, Tool};

/// Errors returned by [`McpClient`] methods.
#[derive(Debug, Error)]
pub enum McpClientError {
    /// 404 — no MCP endpoint at the configured URL.
    #[error("MCP endpoint not found (404) at {0}")]
    EndpointNotFound(String),
    /// 405 — the URL answers HTTP but does not accept MCP POSTs.
    #[error("URL is not an MCP endpoint (405 Method Not Allowed)")]
    NotAnMcpEndpoint,
    /// 500 — the server accepted the request and fell over.
    #[error("MCP server fault (HTTP 500): {0}")]
    ServerFault(String),
    /// Connect failure, DNS failure, or timeout.
    #[error("MCP server unreachable: {0}")]
    Unreachable(String),
    /// Any other non-2xx status.
    #[error("Unexpected HTTP status {0} from MCP server")]
    Http(u16),
    /// The server returned a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// Malformed response body or event stream.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl McpClientError {
    /// Connection-class errors trigger the disconnect-and-reconnect path;
    /// RPC-level errors do not.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::EndpointNotFound(_)
                | Self::NotAnMcpEndpoint
                | Self::ServerFault(_)
                | Self::Unreachable(_)
                | Self::Http(_)
        )
    }
}

/// One JSON-RPC connection to a remote tool server.
pub struct McpClient {
    http: reqwest::Client,
    url: String,
    protocol_version: String,
    /// `Mcp-Session-Id` captured from the server, echoed on later calls.
    session_id: Mutex<Option<String>>,
    next_id: AtomicI64,
}

impl McpClient {
    /// Build a client from a server config. Fails only on malformed headers.
    pub fn new(config: &McpServerConfig) -> Result<Self, McpClientError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in &config.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpClientError::Protocol(format!("Invalid header name: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| McpClientError::Protocol(format!("Invalid header value: {e}")))?;
            default_headers.insert(name, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| McpClientError::Protocol(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: config.url.clone(),
            protocol_version: config.protocol_version.clone(),
            session_id: Mutex::new(None),
            next_id: AtomicI64::new(1),
        })
    }

    /// `initialize` — negotiate protocol version and capabilities. Returns
    /// the server's result object (serverInfo, capabilities).
    pub async fn initialize(&self) -> Result<Value, McpClientError> {
        let result = self
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": self.protocol_version,
                    "capabilities": {"tools": {}},
                    "clientInfo": {
                        "name": "ailink",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;

        // Per the streamable-HTTP flow, the client acknowledges with an
        // `initialized` notification; failures here are not fatal.
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let _ = self.post(&note).await;

        Ok(result)
    }

    /// `tools/list` — fetch the server's advertised tools.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpClientError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| McpClientError::Protocol("tools/list result missing 'tools'".into()))?;
        tools
            .iter()
            .map(|t| {
                serde_json::from_value::<Tool>(t.clone())
                    .map_err(|e| McpClientError::Protocol(format!("Invalid tool entry: {e}")))
            })
            .collect()
    }

    /// `tools/call` — execute a tool and return its result object.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpClientError> {
        self.rpc(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
        )
        .await
    }

    /// `ping` — protocol-level liveness probe.
    pub async fn ping(&self) -> Result<(), McpClientError> {
        self.rpc("ping", json!({})).await.map(|_| ())
    }

    /// Terminate the session. Best-effort: sends a DELETE when the server
    /// issued a session id, and ignores failures.
    pub async fn close(&self) {
        let session_id = self.session_id.lock().expect("session id lock").clone();
        if let Some(sid) = session_id {
            let _ = self
                .http
                .delete(&self.url)
                .header("mcp-session-id", sid)
                .send()
                .await;
        }
    }

    /// Perform one JSON-RPC call and return its `result`.
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, McpClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.post(&body).await?;
        let message = match response {
            RpcResponse::Json(v) => v,
            RpcResponse::Stream(resp) => read_sse_response(resp, id).await?,
        };

        if let Some(error) = message.get("error") {
            return Err(McpClientError::Rpc {
                code: error["code"].as_i64().unwrap_or(0),
                message: error["message"].as_str().unwrap_or("unknown").to_string(),
            });
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    /// POST a JSON-RPC payload; classify transport failures and capture the
    /// session id header.
    async fn post(&self, body: &Value) -> Result<RpcResponse, McpClientError> {
        let mut request = self
            .http
            .post(&self.url)
            .json(body)
            .header("accept", "application/json, text/event-stream")
            .header("mcp-protocol-version", &self.protocol_version);
        {
            let session_id = self.session_id.lock().expect("session id lock");
            if let Some(sid) = session_id.as_deref() {
                request = request.header("mcp-session-id", sid);
            }
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                McpClientError::Unreachable(format!("timeout: {e}"))
            } else {
                McpClientError::Unreachable(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        match status {
            200..=299 => {}
            404 => return Err(McpClientError::EndpointNotFound(self.url.clone())),
            405 => return Err(McpClientError::NotAnMcpEndpoint),
            500 => {
                let text = resp.text().await.unwrap_or_default();
                return Err(McpClientError::ServerFault(text));
            }
            s => return Err(McpClientError::Http(s)),
        }

        if let Some(sid) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let mut session_id = self.session_id.lock().expect("session id lock");
            if session_id.as_deref() != Some(sid) {
                debug!(session_id = %sid, "MCP session established");
                *session_id = Some(sid.to_string());
            }
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            Ok(RpcResponse::Stream(resp))
        } else if status == 202 {
            // Accepted with no body (notification ack)
            Ok(RpcResponse::Json(Value::Null))
        } else {
            let v = resp
                .json::<Value>()
                .await
                .map_err(|e| McpClientError::Protocol(format!("Invalid JSON response: {e}")))?;
            Ok(RpcResponse::Json(v))
        }
    }
}

enum RpcResponse {
    Json(Value),
    Stream(reqwest::Response),
}

/// Read a `text/event-stream` body until the event answering `want_id`
/// arrives. Other events (server notifications, keepalives) are skipped.
async fn read_sse_response(resp: reqwest::Response, want_id: i64) -> Result<Value, McpClientError> {
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| McpClientError::Protocol(format!("Event stream error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        for data in drain_sse_events(&mut buffer) {
            if let Ok(message) = serde_json::from_str::<Value>(&data) {
                if message["id"].as_i64() == Some(want_id) {
                    return Ok(message);
                }
            }
        }
    }

    Err(McpClientError::Protocol(
        "Event stream ended without a response".to_string(),
    ))
}

/// Pull complete SSE events out of `buffer`, returning their joined `data:`
/// payloads. Incomplete trailing events stay buffered.
fn drain_sse_events(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let event: String = buffer.drain(..pos + 2).collect();
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_events_and_keeps_partial() {
        let mut buffer = String::from(
            "event: message\ndata: {\"id\":1}\n\ndata: {\"id\":2}\n\ndata: {\"id\":3}",
        );
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"id\":1}", "{\"id\":2}"]);
        // Unterminated event stays in the buffer
        assert_eq!(buffer, "data: {\"id\":3}");

        buffer.push_str("\n\n");
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"id\":3}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn multiline_data_joined_with_newline() {
        let mut buffer = String::from("data: line1\ndata: line2\n\n");
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn connection_error_classification() {
        assert!(McpClientError::Unreachable("x".into()).is_connection_error());
        assert!(McpClientError::EndpointNotFound("u".into()).is_connection_error());
        assert!(McpClientError::NotAnMcpEndpoint.is_connection_error());
        assert!(McpClientError::ServerFault("x".into()).is_connection_error());
        assert!(!McpClientError::Rpc {
            code: -32601,
            message: "no such method".into()
        }
        .is_connection_error());
        assert!(!McpClientError::Protocol("x".into()).is_connection_error());
    }
}
