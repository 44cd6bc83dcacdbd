//! Server side of a streamed turn.
//!
//! [`StreamRelay`] drives one provider stream per request and turns it into
//! wire frames: a `Delta` for every non-empty chunk, then exactly one terminal
//! frame (`Done` or `Error`). The frame stream is pulled by the HTTP body, so
//! a slow client simply suspends the relay; nothing is buffered or dropped.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::ai::{CompletionRequest, LlmBackend, ProviderError};
use crate::frame::{self, StreamEvent};

pub const CANCELLED_MESSAGE: &str = "request cancelled";

/// Shown in place of a provider failure that carries no message.
pub const GENERIC_ERROR: &str = "Server error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Opened,
    Streaming,
    Completed,
    Failed,
}

pub struct StreamRelay {
    backend: Arc<dyn LlmBackend>,
}

impl StreamRelay {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Events for one request, ending with exactly one terminal event.
    pub fn events(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let backend = Arc::clone(&self.backend);

        async_stream::stream! {
            let mut state = RelayState::Idle;
            transition(&mut state, RelayState::Opened, &request.model);
            if !backend.supports_streaming() {
                tracing::debug!(
                    model = %request.model,
                    "backend does not stream, relaying one chunk"
                );
            }

            let opened = tokio::select! {
                _ = cancel.cancelled() => None,
                opened = backend.stream(&request) => Some(opened),
            };
            let mut chunks = match opened {
                Some(Ok(chunks)) => chunks,
                Some(Err(err)) => {
                    tracing::warn!(%err, model = %request.model, "provider stream failed to open");
                    transition(&mut state, RelayState::Failed, &request.model);
                    yield StreamEvent::error(error_text(&err));
                    return;
                }
                None => {
                    transition(&mut state, RelayState::Failed, &request.model);
                    yield StreamEvent::error(CANCELLED_MESSAGE);
                    return;
                }
            };
            transition(&mut state, RelayState::Streaming, &request.model);

            let mut relayed = 0usize;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => Err(()),
                    next = chunks.next() => Ok(next),
                };
                match next {
                    Ok(Some(Ok(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        relayed += 1;
                        yield StreamEvent::Delta { text };
                    }
                    Ok(Some(Err(err))) => {
                        tracing::warn!(%err, relayed, "provider stream failed mid-response");
                        transition(&mut state, RelayState::Failed, &request.model);
                        yield StreamEvent::error(error_text(&err));
                        return;
                    }
                    Ok(None) => {
                        tracing::debug!(relayed, "provider stream exhausted");
                        transition(&mut state, RelayState::Completed, &request.model);
                        yield StreamEvent::Done;
                        return;
                    }
                    Err(()) => {
                        tracing::info!(relayed, "relay cancelled");
                        transition(&mut state, RelayState::Failed, &request.model);
                        yield StreamEvent::error(CANCELLED_MESSAGE);
                        return;
                    }
                }
            }
        }
    }

    /// Wire frames for one request, one frame per event.
    pub fn frames(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Bytes> + Send + 'static {
        self.events(request, cancel).map(|event| frame::encode(&event))
    }
}

fn transition(state: &mut RelayState, next: RelayState, model: &str) {
    tracing::debug!(from = ?*state, to = ?next, %model, "relay state");
    *state = next;
}

/// Message shown to the client for a provider failure.
pub fn error_text(err: &ProviderError) -> String {
    if err.message().trim().is_empty() {
        GENERIC_ERROR.to_string()
    } else {
        err.message().to_string()
    }
}
