//! OpenAI-surface request/response types and device socket payloads.
//!
//! ## HTTP surface (OpenAI-compatible)
//!
//! Requests are typed for validation; responses are built as JSON values in
//! the OpenAI envelope shapes (`chat.completion`, model list).
//!
//! ## Socket payloads (server ⇄ device)
//!
//! All messages are JSON objects with a `"type"` field and camelCase keys:
//!
//! | Direction | Type               | Key fields                                           |
//! |-----------|--------------------|------------------------------------------------------|
//! | S → D     | `chat_completion`  | `requestId`, `message`, `model`, `temperature`, `max_tokens` |
//! | S → D     | `text_to_speech`   | `requestId`, `text`, `model`, `voice`, `response_format`, `speed` |
//! | D → S     | `response`         | `requestId`, `response`, `model`                     |
//! | D → S     | `tts_response`     | `requestId`, `audioData` (base64), `audioFormat`     |
//! | D → S     | `message_received` / `tts_received` | `requestId` (delivery ack)          |
//! | D → S     | `error` / `tts_error` | `requestId`, `error`                              |
//! | both      | `ping` / `pong`    | `timestamp` (liveness only, never correlated)        |

use serde::Deserialize;
use serde_json::{json, Value};

/// Speech output formats accepted by `POST /{device}/v1/audio/speech`.
pub const SPEECH_FORMATS: [&str; 6] = ["mp3", "opus", "aac", "flac", "wav", "pcm"];

/// Minimum / maximum playback speed accepted for speech requests.
pub const SPEED_RANGE: (f64, f64) = (0.25, 4.0);

/// `POST /{device}/v1/chat/completions` request body (OpenAI chat schema).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// A single entry in the OpenAI `messages` array.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// `POST /{device}/v1/audio/speech` request body (OpenAI TTS schema).
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechRequest {
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default)]
    pub input: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_speech_format")]
    pub response_format: String,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_chat_model() -> String {
    "device-llm".to_string()
}
fn default_tts_model() -> String {
    "tts-1".to_string()
}
fn default_voice() -> String {
    "alloy".to_string()
}
fn default_speech_format() -> String {
    "mp3".to_string()
}
fn default_speed() -> f64 {
    1.0
}

/// A device reply routed back through the broker to a waiting HTTP handler.
#[derive(Debug)]
pub enum DeviceReply {
    /// `response` — chat completion text.
    Chat {
        text: String,
        model: Option<String>,
    },
    /// `tts_response` — decoded audio bytes. Empty when the device omitted
    /// or mangled the payload.
    Speech {
        audio: Vec<u8>,
        format: Option<String>,
    },
    /// `error` / `tts_error` — device-side failure.
    Error { message: String },
    /// The device socket went away while the request was pending.
    Disconnected,
}

/// `Content-Type` for a speech response format, or `None` if unsupported.
#[must_use]
pub fn audio_content_type(format: &str) -> Option<&'static str> {
    match format {
        "mp3" => Some("audio/mpeg"),
        "opus" => Some("audio/opus"),
        "aac" => Some("audio/aac"),
        "flac" => Some("audio/flac"),
        "wav" => Some("audio/wav"),
        "pcm" => Some("audio/pcm"),
        _ => None,
    }
}

/// Build the outbound `chat_completion` socket command.
#[must_use]
pub fn chat_command(request_id: &str, message: &str, req: &ChatCompletionRequest) -> Value {
    json!({
        "type": "chat_completion",
        "requestId": request_id,
        "message": message,
        "model": req.model,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
    })
}

/// Build the outbound `text_to_speech` socket command.
#[must_use]
pub fn speech_command(request_id: &str, req: &SpeechRequest) -> Value {
    json!({
        "type": "text_to_speech",
        "requestId": request_id,
        "text": req.input,
        "model": req.model,
        "voice": req.voice,
        "response_format": req.response_format,
        "speed": req.speed,
    })
}

/// Seconds since the Unix epoch, for `created` fields.
#[must_use]
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wrap completion text in the OpenAI `chat.completion` envelope.
///
/// Token counts are byte-length estimates — the device does not report real
/// usage, and clients only need the fields to be present and plausible.
#[must_use]
pub fn chat_completion_body(model: &str, prompt: &str, completion: &str) -> Value {
    let prompt_tokens = prompt.len() / 4;
    let completion_tokens = completion.len() / 4;
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": completion,
            },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_covers_every_accepted_format() {
        for format in SPEECH_FORMATS {
            assert!(audio_content_type(format).is_some(), "missing: {format}");
        }
        assert_eq!(audio_content_type("mp3"), Some("audio/mpeg"));
        assert_eq!(audio_content_type("ogg"), None);
    }

    #[test]
    fn chat_command_uses_camel_case_request_id() {
        let req: ChatCompletionRequest =
            serde_json::from_value(json!({"messages": [{"role": "user", "content": "hi"}]}))
                .unwrap();
        let cmd = chat_command("r-1", "hi", &req);
        assert_eq!(cmd["type"], "chat_completion");
        assert_eq!(cmd["requestId"], "r-1");
        assert_eq!(cmd["model"], "device-llm");
    }

    #[test]
    fn speech_request_defaults() {
        let req: SpeechRequest = serde_json::from_value(json!({"input": "hello"})).unwrap();
        assert_eq!(req.response_format, "mp3");
        assert_eq!(req.voice, "alloy");
        assert!((req.speed - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn completion_body_shape() {
        let body = chat_completion_body("m", "prompt text", "hello");
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body["usage"]["total_tokens"].as_u64().is_some());
    }
}
