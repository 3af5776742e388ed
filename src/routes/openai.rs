//! OpenAI-compatible endpoints, device-scoped.
//!
//! `POST /{device}/v1/chat/completions` and `POST /{device}/v1/audio/speech`
//! are the two broker-backed routes: they admit, dispatch a device command,
//! and wait (bounded) for the correlated reply. `GET /{device}/v1/models` is
//! a static listing.
//!
//! Chat replies may contain a tool-call envelope; the handler then executes
//! the tool through the MCP manager and dispatches a follow-up turn with the
//! result, up to `server.max_tool_hops` round trips.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::broker::RequestKind;
use crate::error::ApiError;
use crate::history::{ConversationTurn, TurnRole};
use crate::mcp::{parse_tool_call, ToolCall};
use crate::protocol::{
    audio_content_type, chat_command, chat_completion_body, speech_command, unix_timestamp,
    ChatCompletionRequest, DeviceReply, SpeechRequest, SPEECH_FORMATS, SPEED_RANGE,
};
use crate::state::AppState;

/// Synthesized reply when the device does not answer within the budget.
/// Chat callers always get usable text, never a structured timeout.
const TIMEOUT_FALLBACK: &str = "I'm sorry, I couldn't get a response from the \
    device in time. Please try again in a moment.";

/// Synthesized reply when the device drops mid-request.
const DISCONNECT_FALLBACK: &str = "I'm sorry, the device went offline before \
    it could answer. Please try again once it reconnects.";

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

/// Parse a request body, mapping malformed JSON to the OpenAI error envelope.
fn parse_body<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))
}

/// Assemble the text dispatched to the device: MCP tool preamble, the most
/// recent conversation turn for context, then the user's message.
fn compose_outbound(preamble: &str, previous: Option<&ConversationTurn>, user_text: &str) -> String {
    let mut out = String::new();
    if !preamble.is_empty() {
        out.push_str(preamble);
        out.push_str("\n\n");
    }
    if let Some(turn) = previous {
        out.push_str(&format!(
            "Previous {}: {}\n\n",
            turn.role.as_str(),
            turn.content
        ));
    }
    out.push_str(user_text);
    out
}

/// Follow-up turn carrying a tool result (or failure) back to the model.
fn tool_result_message(call: &ToolCall, result: &Result<Value, ApiError>) -> String {
    match result {
        Ok(value) => format!(
            "Tool '{}' on server '{}' returned:\n{}\n\nUse this result to answer \
             the original question. Reply with plain text unless another tool \
             call is required.",
            call.tool,
            call.server,
            serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".into()),
        ),
        Err(e) => format!(
            "Tool '{}' on server '{}' failed: {e}\n\nAnswer the original \
             question without it, or try a different tool.",
            call.tool, call.server,
        ),
    }
}

/// `POST /{device_id}/v1/chat/completions` — OpenAI chat schema in and out.
pub async fn chat_completions(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let req: ChatCompletionRequest = parse_body(&body)?;

    let user_text = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .ok_or_else(|| ApiError::Validation("messages must contain a user message".to_string()))?;
    if user_text.trim().is_empty() {
        return Err(ApiError::Validation(
            "user message content must not be empty".to_string(),
        ));
    }

    let preamble = state.mcp.prompt_preamble(&device_id).await;
    let previous = state.history.last_turn(&device_id).await;
    let mut outbound = compose_outbound(&preamble, previous.as_ref(), &user_text);
    let budget = Duration::from_secs(state.config.server.request_timeout_secs);
    let max_hops = state.config.server.max_tool_hops;

    let mut hops = 0u32;
    let final_text = loop {
        let admitted = state.broker.admit(&device_id, RequestKind::Chat).await?;
        let command = chat_command(&admitted.request_id, &outbound, &req);
        state
            .broker
            .dispatch(&admitted.request_id, &device_id, command)
            .await?;

        let reply = match timeout(budget, admitted.reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => break DISCONNECT_FALLBACK.to_string(),
            Err(_) => {
                state.broker.expire(&admitted.request_id).await;
                break TIMEOUT_FALLBACK.to_string();
            }
        };

        match reply {
            DeviceReply::Chat { text, .. } => {
                if hops < max_hops {
                    if let Some(call) = parse_tool_call(&text) {
                        hops += 1;
                        debug!(
                            device_id = %device_id,
                            server = %call.server,
                            tool = %call.tool,
                            hop = hops,
                            "Chat turn requested a tool"
                        );
                        let result = state
                            .mcp
                            .call_tool(&device_id, &call.server, &call.tool, call.arguments.clone())
                            .await;
                        outbound = tool_result_message(&call, &result);
                        continue;
                    }
                }
                // Completed exchange goes into the rolling window
                state
                    .history
                    .push(&device_id, TurnRole::User, user_text.clone())
                    .await;
                state
                    .history
                    .push(&device_id, TurnRole::Assistant, text.clone())
                    .await;
                break text;
            }
            DeviceReply::Error { message } => {
                return Err(ApiError::Internal(format!("Device error: {message}")));
            }
            DeviceReply::Disconnected => break DISCONNECT_FALLBACK.to_string(),
            DeviceReply::Speech { .. } => {
                return Err(ApiError::Internal(
                    "Device sent an audio reply to a chat request".to_string(),
                ));
            }
        }
    };

    info!(device_id = %device_id, hops, "Chat completion served");
    Ok(Json(chat_completion_body(&req.model, &outbound, &final_text)))
}

/// `GET /{device_id}/v1/models` — static model listing, PIN-gated.
pub async fn list_models(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let created = unix_timestamp();
    Ok(Json(json!({
        "object": "list",
        "data": [
            {"id": "device-llm", "object": "model", "created": created, "owned_by": "device"},
            {"id": "tts-1", "object": "model", "created": created, "owned_by": "device"},
        ],
    })))
}

/// `POST /{device_id}/v1/audio/speech` — OpenAI TTS schema in, raw audio out.
pub async fn create_speech(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state
        .registry
        .verify_pin(&device_id, auth_header(&headers))
        .await?;
    let req: SpeechRequest = parse_body(&body)?;

    if req.input.trim().is_empty() {
        return Err(ApiError::Validation("input must not be empty".to_string()));
    }
    if !SPEECH_FORMATS.contains(&req.response_format.as_str()) {
        return Err(ApiError::Validation(format!(
            "response_format must be one of {}",
            SPEECH_FORMATS.join(", ")
        )));
    }
    if req.speed < SPEED_RANGE.0 || req.speed > SPEED_RANGE.1 {
        return Err(ApiError::Validation(format!(
            "speed must be between {} and {}",
            SPEED_RANGE.0, SPEED_RANGE.1
        )));
    }

    let budget = Duration::from_secs(state.config.server.request_timeout_secs);
    let admitted = state.broker.admit(&device_id, RequestKind::Speech).await?;
    let command = speech_command(&admitted.request_id, &req);
    state
        .broker
        .dispatch(&admitted.request_id, &device_id, command)
        .await?;

    let reply = match timeout(budget, admitted.reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => {
            return Err(ApiError::ServiceUnavailable(format!(
                "Device '{device_id}' disconnected during synthesis"
            )));
        }
        Err(_) => {
            // No safe synthetic audio fallback exists, so speech timeouts
            // surface as a structured error.
            state.broker.expire(&admitted.request_id).await;
            return Err(ApiError::Timeout(state.config.server.request_timeout_secs));
        }
    };

    match reply {
        DeviceReply::Speech { audio, format } => {
            if audio.is_empty() {
                return Err(ApiError::NoAudioData);
            }
            let format = format.unwrap_or(req.response_format);
            let content_type = audio_content_type(&format).unwrap_or("application/octet-stream");
            info!(device_id = %device_id, format = %format, bytes = audio.len(), "Speech served");
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"speech.{format}\""),
                )
                .body(Body::from(audio))
                .map_err(|e| ApiError::Internal(format!("Failed to build response: {e}")))
        }
        DeviceReply::Error { message } => {
            Err(ApiError::Internal(format!("Device error: {message}")))
        }
        DeviceReply::Disconnected => Err(ApiError::ServiceUnavailable(format!(
            "Device '{device_id}' disconnected during synthesis"
        ))),
        DeviceReply::Chat { .. } => Err(ApiError::Internal(
            "Device sent a chat reply to a speech request".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_includes_preamble_and_context() {
        let previous = ConversationTurn {
            role: TurnRole::Assistant,
            content: "It is sunny.".into(),
            timestamp_ms: 0,
        };
        let out = compose_outbound("TOOLS...", Some(&previous), "And tomorrow?");
        assert!(out.starts_with("TOOLS...\n\n"));
        assert!(out.contains("Previous assistant: It is sunny."));
        assert!(out.ends_with("And tomorrow?"));
    }

    #[test]
    fn compose_without_context_is_just_the_message() {
        assert_eq!(compose_outbound("", None, "hi"), "hi");
    }

    #[test]
    fn tool_result_message_carries_result_and_failure() {
        let call = ToolCall {
            server: "files".into(),
            tool: "read_file".into(),
            arguments: json!({}),
        };
        let ok = tool_result_message(&call, &Ok(json!({"content": "x"})));
        assert!(ok.contains("read_file"));
        assert!(ok.contains("\"content\""));

        let err = tool_result_message(
            &call,
            &Err(ApiError::ServiceUnavailable("gone".into())),
        );
        assert!(err.contains("failed"));
        assert!(err.contains("gone"));
    }
}
