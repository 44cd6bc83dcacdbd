//! End-to-end tests: a relay on a local port backed by a scripted provider.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chat_relay::ai::{CompletionRequest, LlmBackend, ProviderError, ProviderResult, TextStream};
use chat_relay::client::RelayClient;
use chat_relay::controller::{ConversationController, TurnFailure, TurnOutcome};
use chat_relay::history::{HistoryStore, MemoryStore};
use chat_relay::server::{self, AppState};
use chat_relay::types::{ChatMessage, ChatRequest, MODEL_HEADER};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Provider stand-in that replays fixed chunks and records requested models.
#[derive(Clone)]
struct Scripted {
    chunks: Result<Vec<String>, String>,
    models: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    fn replying(chunks: &[&str]) -> Self {
        Self {
            chunks: Ok(chunks.iter().map(|c| c.to_string()).collect()),
            models: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            chunks: Err(message.to_string()),
            models: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }

    fn record(&self, request: &CompletionRequest) -> ProviderResult<Vec<String>> {
        self.models.lock().unwrap().push(request.model.clone());
        self.chunks.clone().map_err(ProviderError::new)
    }
}

#[async_trait]
impl LlmBackend for Scripted {
    async fn complete(&self, request: &CompletionRequest) -> ProviderResult<String> {
        Ok(self.record(request)?.concat())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &CompletionRequest) -> ProviderResult<TextStream> {
        let chunks = self.record(request)?;
        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

struct Relay {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Relay {
    async fn start(backend: Scripted) -> Self {
        let shutdown = CancellationToken::new();
        let state = AppState::new(Arc::new(backend), "default-model", shutdown.clone());
        let app = server::router(state, None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, app, shutdown.clone()));
        Self { addr, shutdown }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn hello_request() -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::user("hi")],
        system: Some("be brief".to_string()),
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let relay = Relay::start(Scripted::replying(&[])).await;
    let body: serde_json::Value = reqwest::get(relay.url("/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, serde_json::json!({ "status": "ok" }));
}

#[tokio::test]
async fn stream_endpoint_sends_frames_and_headers() {
    let backend = Scripted::replying(&["Hel", "lo, ", "world!"]);
    let relay = Relay::start(backend.clone()).await;

    let response = reqwest::Client::new()
        .post(relay.url("/api/chat/stream"))
        .json(&hello_request())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "text/event-stream; charset=utf-8");
    assert_eq!(headers["cache-control"], "no-cache, no-transform");
    assert_eq!(headers["x-accel-buffering"], "no");

    let body = response.text().await.unwrap();
    assert_eq!(
        body,
        concat!(
            "data: {\"delta\":\"Hel\"}\n\n",
            "data: {\"delta\":\"lo, \"}\n\n",
            "data: {\"delta\":\"world!\"}\n\n",
            "data: {\"done\":true}\n\n",
        )
    );
    assert_eq!(backend.models(), ["default-model"]);
}

#[tokio::test]
async fn provider_failure_is_reported_in_band() {
    let relay = Relay::start(Scripted::failing("quota exceeded")).await;

    let response = reqwest::Client::new()
        .post(relay.url("/api/chat/stream"))
        .json(&hello_request())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.text().await.unwrap(),
        "data: {\"error\":\"quota exceeded\"}\n\n"
    );
}

#[tokio::test]
async fn model_header_overrides_default() {
    let backend = Scripted::replying(&["ok"]);
    let relay = Relay::start(backend.clone()).await;
    let client = reqwest::Client::new();

    for model in ["gemini-custom", "   "] {
        client
            .post(relay.url("/api/chat/stream"))
            .header(MODEL_HEADER, model)
            .json(&hello_request())
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
    }

    assert_eq!(backend.models(), ["gemini-custom", "default-model"]);
}

#[tokio::test]
async fn chat_endpoint_returns_whole_reply() {
    let relay = Relay::start(Scripted::replying(&["Hel", "lo"])).await;

    let response = reqwest::Client::new()
        .post(relay.url("/api/chat"))
        .json(&hello_request())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "text": "Hello" }));
}

#[tokio::test]
async fn chat_endpoint_reports_provider_errors() {
    let relay = Relay::start(Scripted::failing("")).await;

    let response = reqwest::Client::new()
        .post(relay.url("/api/chat"))
        .json(&hello_request())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Server error" }));
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let relay = Relay::start(Scripted::replying(&["unused"])).await;

    let response = reqwest::Client::new()
        .post(relay.url("/api/chat/stream"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn controller_completes_turn_through_relay() {
    let backend = Scripted::replying(&["Hel", "lo, ", "world!"]);
    let relay = Relay::start(backend.clone()).await;
    let store = MemoryStore::new();

    let mut chat = ConversationController::new(
        RelayClient::new(&relay.url("")),
        HistoryStore::new(store.clone()),
    )
    .with_model("gemini-test");

    let cancel = CancellationToken::new();
    let mut streamed = String::new();
    let outcome = chat
        .submit("hi", &cancel, |delta| streamed.push_str(delta))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Completed(ChatMessage::assistant("Hello, world!"))
    );
    assert_eq!(streamed, "Hello, world!");
    assert_eq!(
        HistoryStore::new(store).load(),
        vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("Hello, world!"),
        ]
    );
    assert_eq!(backend.models(), ["gemini-test"]);
}

#[tokio::test]
async fn controller_surfaces_provider_error() {
    let relay = Relay::start(Scripted::failing("rate limited")).await;
    let store = MemoryStore::new();

    let mut chat = ConversationController::new(
        RelayClient::new(&relay.url("")),
        HistoryStore::new(store.clone()),
    );
    let outcome = chat
        .submit("hi", &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Failed(TurnFailure::Provider("rate limited".to_string()))
    );
    assert_eq!(
        HistoryStore::new(store).load(),
        vec![ChatMessage::user("hi")]
    );
}

#[tokio::test]
async fn unreachable_relay_is_a_transport_failure() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut chat = ConversationController::new(
        RelayClient::new(&format!("http://{addr}")),
        HistoryStore::new(MemoryStore::new()),
    );
    let outcome = chat
        .submit("hi", &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Failed(TurnFailure::Transport(_))
    ));
}

#[test]
fn relay_refuses_to_start_without_credential() {
    let cwd = tempfile::tempdir().unwrap();
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_chat-relay"))
        .current_dir(cwd.path())
        .env_remove("GOOGLE_API_KEY")
        .env("PORT", "0")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let logs = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(logs.contains("GOOGLE_API_KEY"), "{logs}");
}
