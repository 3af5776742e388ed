//! End-to-end scenarios: a real HTTP listener, a real device WebSocket, and
//! the broker correlating between them.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ailink::{AppState, Config};

type DeviceWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bind the app on an ephemeral port; returns the state and `host:port`.
async fn spawn_server() -> (AppState, String) {
    spawn_server_with(Config::default()).await
}

async fn spawn_server_with(config: Config) -> (AppState, String) {
    let state = AppState::new(config);
    let app = ailink::routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("127.0.0.1:{}", addr.port()))
}

/// Connect a device socket and consume the registration ack.
async fn connect_device(addr: &str, device_id: &str) -> DeviceWs {
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?device_id={device_id}"))
            .await
            .expect("device connect");
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "register_ack");
    assert_eq!(ack["deviceId"], device_id);
    ws
}

/// Read the next text frame as JSON.
async fn next_json(ws: &mut DeviceWs) -> Value {
    loop {
        match ws.next().await.expect("socket open").expect("frame") {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON"),
            Message::Close(_) => panic!("socket closed"),
            _ => {}
        }
    }
}

async fn send_json(ws: &mut DeviceWs, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

fn chat_body() -> Value {
    json!({"messages": [{"role": "user", "content": "hi"}]})
}

#[tokio::test]
async fn chat_completion_round_trip() {
    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/chat/completions");
    let request = tokio::spawn(client.post(&url).json(&chat_body()).send());

    // The device receives the correlated command...
    let command = next_json(&mut device).await;
    assert_eq!(command["type"], "chat_completion");
    assert_eq!(command["message"], "hi");
    let request_id = command["requestId"].as_str().unwrap().to_string();

    // ...and its reply resolves the waiting HTTP response.
    send_json(
        &mut device,
        json!({"type": "response", "requestId": request_id, "response": "hello", "model": "m"}),
    )
    .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn chat_without_device_is_503_and_leaves_no_pending_entry() {
    let (state, addr) = spawn_server().await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/dev1/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "service_unavailable");
    assert_eq!(state.broker.pending_count().await, 0);
}

#[tokio::test]
async fn second_chat_while_pending_is_429() {
    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/chat/completions");
    let first = tokio::spawn(client.post(&url).json(&chat_body()).send());

    // Wait until the first request is dispatched to the device
    let command = next_json(&mut device).await;
    let request_id = command["requestId"].as_str().unwrap().to_string();

    // Single-flight: a second chat while one is outstanding is rejected
    // immediately and nothing further reaches the device.
    let second = client.post(&url).json(&chat_body()).send().await.unwrap();
    assert_eq!(second.status(), 429);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"]["type"], "device_busy");

    // The first request still completes normally.
    send_json(
        &mut device,
        json!({"type": "response", "requestId": request_id, "response": "done"}),
    )
    .await;
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), 200);
}

#[tokio::test]
async fn pin_gate_over_http() {
    let (_state, addr) = spawn_server().await;
    let client = reqwest::Client::new();
    let models_url = format!("http://{addr}/dev1/v1/models");

    // No PIN set: unauthenticated requests pass
    assert_eq!(client.get(&models_url).send().await.unwrap().status(), 200);

    // Enable a PIN (allowed unauthenticated while no PIN exists)
    let response = client
        .post(format!("http://{addr}/dev1/enable-pin"))
        .json(&json!({"pin": "123456"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Missing and wrong credentials are rejected
    assert_eq!(client.get(&models_url).send().await.unwrap().status(), 401);
    assert_eq!(
        client
            .get(&models_url)
            .bearer_auth("654321")
            .send()
            .await
            .unwrap()
            .status(),
        401
    );
    // The exact PIN passes
    assert_eq!(
        client
            .get(&models_url)
            .bearer_auth("123456")
            .send()
            .await
            .unwrap()
            .status(),
        200
    );

    // Malformed PINs are rejected with a validation error
    let response = client
        .post(format!("http://{addr}/dev1/change-pin"))
        .bearer_auth("123456")
        .json(&json!({"pin": "12ab"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Disable with the current PIN, then unauthenticated passes again
    let response = client
        .post(format!("http://{addr}/dev1/disable-pin"))
        .bearer_auth("123456")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(client.get(&models_url).send().await.unwrap().status(), 200);
}

#[tokio::test]
async fn speech_round_trip_returns_audio_bytes() {
    use base64::Engine;

    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/audio/speech");
    let request = tokio::spawn(
        client
            .post(&url)
            .json(&json!({"input": "say this", "response_format": "mp3"}))
            .send(),
    );

    let command = next_json(&mut device).await;
    assert_eq!(command["type"], "text_to_speech");
    assert_eq!(command["text"], "say this");
    let request_id = command["requestId"].as_str().unwrap().to_string();

    let audio = b"ID3fakeaudio".to_vec();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&audio);
    send_json(
        &mut device,
        json!({
            "type": "tts_response",
            "requestId": request_id,
            "audioData": encoded,
            "audioFormat": "mp3",
        }),
    )
    .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "audio/mpeg"
    );
    assert!(response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("speech.mp3"));
    assert_eq!(response.bytes().await.unwrap().to_vec(), audio);
}

#[tokio::test]
async fn speech_reply_without_audio_is_500() {
    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/audio/speech");
    let request = tokio::spawn(client.post(&url).json(&json!({"input": "x"})).send());

    let command = next_json(&mut device).await;
    let request_id = command["requestId"].as_str().unwrap().to_string();
    send_json(
        &mut device,
        json!({"type": "tts_response", "requestId": request_id, "audioFormat": "mp3"}),
    )
    .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "no_audio_data");
}

#[tokio::test]
async fn speech_rejects_bad_format_and_speed() {
    let (_state, addr) = spawn_server().await;
    let _device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/audio/speech");

    let response = client
        .post(&url)
        .json(&json!({"input": "x", "response_format": "ogg"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(&url)
        .json(&json!({"input": "x", "speed": 9.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn failed_tool_call_feeds_result_back_to_device() {
    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/chat/completions");
    let request = tokio::spawn(client.post(&url).json(&chat_body()).send());

    // First hop: the model asks for a tool on a server that isn't registered
    let command = next_json(&mut device).await;
    let request_id = command["requestId"].as_str().unwrap().to_string();
    send_json(
        &mut device,
        json!({
            "type": "response",
            "requestId": request_id,
            "response": r#"{"server": "nope", "tool": "read_file", "arguments": {}}"#,
        }),
    )
    .await;

    // Second hop: the bridge reports the tool failure back to the model
    let follow_up = next_json(&mut device).await;
    assert_eq!(follow_up["type"], "chat_completion");
    let follow_up_text = follow_up["message"].as_str().unwrap();
    assert!(follow_up_text.contains("failed"));
    assert!(follow_up_text.contains("read_file"));
    let request_id = follow_up["requestId"].as_str().unwrap().to_string();
    send_json(
        &mut device,
        json!({"type": "response", "requestId": request_id, "response": "done without tool"}),
    )
    .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "done without tool"
    );
}

#[tokio::test]
async fn timeout_gives_chat_fallback_text_and_speech_structured_error() {
    let mut config = Config::default();
    config.server.request_timeout_secs = 1;
    let (state, addr) = spawn_server_with(config).await;
    let mut device = connect_device(&addr, "dev1").await;
    let client = reqwest::Client::new();

    // Chat: the device stays silent, the caller still gets usable text.
    let response = client
        .post(format!("http://{addr}/dev1/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let text = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(text.contains("in time"));
    // The table entry is gone
    assert_eq!(state.broker.pending_count().await, 0);

    // A late real reply after the fallback is a no-op
    let command = next_json(&mut device).await;
    assert_eq!(command["type"], "chat_completion");
    send_json(
        &mut device,
        json!({"type": "response", "requestId": command["requestId"], "response": "late"}),
    )
    .await;

    // Speech: no safe synthetic audio exists, so the timeout is structured.
    let response = client
        .post(format!("http://{addr}/dev1/v1/audio/speech"))
        .json(&json!({"input": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "timeout_error");

    // Both slots are free again
    let inflight = state.broker.inflight_kinds("dev1").await;
    assert!(inflight.is_empty());
}

#[tokio::test]
async fn device_ping_gets_pong() {
    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    send_json(&mut device, json!({"type": "ping", "timestamp": 12345})).await;
    let pong = next_json(&mut device).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["timestamp"], 12345);
}

#[tokio::test]
async fn device_disconnect_drains_pending_chat_with_fallback_text() {
    let (_state, addr) = spawn_server().await;
    let mut device = connect_device(&addr, "dev1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/dev1/v1/chat/completions");
    let request = tokio::spawn(client.post(&url).json(&chat_body()).send());

    // Ensure the command was dispatched, then drop the socket without replying
    let _command = next_json(&mut device).await;
    drop(device);

    let response = request.await.unwrap().unwrap();
    // Chat degrades to synthesized text rather than a bare error
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let text = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(text.contains("offline"));
}
