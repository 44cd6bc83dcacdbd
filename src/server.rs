//! HTTP server setup: router, API handlers and graceful shutdown.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::ai::{CompletionRequest, LlmBackend};
use crate::relay::{StreamRelay, error_text};
use crate::types::{ChatRequest, MODEL_HEADER};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    relay: Arc<StreamRelay>,
    default_model: Arc<str>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        default_model: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            relay: Arc::new(StreamRelay::new(backend)),
            default_model: Arc::from(default_model.into()),
            shutdown,
        }
    }

    /// Pick the model from the `X-Model` header, falling back to the default.
    fn completion_request(&self, headers: &HeaderMap, request: ChatRequest) -> CompletionRequest {
        let model = headers
            .get(MODEL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&*self.default_model)
            .to_string();

        CompletionRequest {
            messages: request.messages,
            system: request.system,
            model,
        }
    }
}

// -- Response types --

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ChatReply {
    text: String,
}

#[derive(Serialize)]
struct ChatFailure {
    error: String,
}

/// Build the application router. Unmatched paths are served from
/// `static_dir` (with an `index.html` fallback) when one is given.
pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream));

    let mut app = Router::new().nest("/api", api_routes);
    if let Some(dir) = static_dir {
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).fallback(index));
    }

    app.layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` fires, then let in-flight responses finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

// -- API handlers --

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, (StatusCode, Json<ChatFailure>)> {
    let request = state.completion_request(&headers, request);
    tracing::info!(model = %request.model, messages = request.messages.len(), "chat request");

    match state.relay.backend().complete(&request).await {
        Ok(text) => Ok(Json(ChatReply { text })),
        Err(err) => {
            tracing::error!(%err, model = %request.model, "chat completion failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatFailure {
                    error: error_text(&err),
                }),
            ))
        }
    }
}

/// Stream one assistant turn as `data:` frames.
///
/// The status is always 200 once the request parses; provider failures are
/// reported in-band as a terminal `error` frame.
async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let request = state.completion_request(&headers, request);
    tracing::info!(
        model = %request.model,
        messages = request.messages.len(),
        "streaming chat request"
    );

    let frames = state
        .relay
        .frames(request, state.shutdown.child_token())
        .map(Ok::<_, Infallible>);

    (
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
