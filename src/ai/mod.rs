//! Provider backends for the relay.
//!
//! A backend turns one conversation snapshot into either a full reply
//! (`complete`) or a stream of text chunks (`stream`). The relay only sees the
//! [`LlmBackend`] trait; `GeminiBackend` is the production implementation.

mod gemini;

pub use gemini::{DEFAULT_API_BASE, GeminiBackend, parse_gemini_sse_data};

use crate::types::ChatMessage;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

// ============================================
// Error Types
// ============================================

/// Failure reported by a generation provider, carried as a human-readable
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError(String);

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::new(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::new(err.to_string())
    }
}

impl From<rig::completion::PromptError> for ProviderError {
    fn from(err: rig::completion::PromptError) -> Self {
        ProviderError::new(err.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Text chunks in provider order. The stream ends on exhaustion; an `Err`
/// item is the last one.
pub type TextStream = BoxStream<'static, ProviderResult<String>>;

// ============================================
// Backend Trait
// ============================================

/// One completion request as the provider sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub model: String,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> ProviderResult<String>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Default: run a full completion and hand it back as a single chunk.
    async fn stream(&self, request: &CompletionRequest) -> ProviderResult<TextStream> {
        let text = self.complete(request).await?;
        Ok(futures::stream::once(async move { Ok(text) }).boxed())
    }
}
