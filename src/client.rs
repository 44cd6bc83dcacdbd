//! HTTP transport from the conversation controller to a running relay.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};

use crate::types::{ChatRequest, MODEL_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Network error: relay responded with {0}")]
    Status(StatusCode),

    #[error("Network error: {0}")]
    Other(String),
}

/// Raw response body, in whatever pieces the network delivered.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Opens one streamed turn against a relay.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(
        &self,
        request: &ChatRequest,
        model: Option<&str>,
    ) -> Result<ByteStream, TransportError>;
}

pub struct RelayClient {
    client: Client,
    endpoint: String,
}

impl RelayClient {
    /// `base_url` is the relay origin, e.g. `http://localhost:3000`.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/api/chat/stream", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for RelayClient {
    async fn open(
        &self,
        request: &ChatRequest,
        model: Option<&str>,
    ) -> Result<ByteStream, TransportError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(request);
        if let Some(model) = model {
            builder = builder.header(MODEL_HEADER, model);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, endpoint = %self.endpoint, "relay rejected chat request");
            return Err(TransportError::Status(status));
        }

        Ok(response
            .bytes_stream()
            .map(|item| item.map_err(TransportError::from))
            .boxed())
    }
}
