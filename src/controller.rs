//! Client-side conversation turns.
//!
//! [`ConversationController`] owns the in-memory history and the visible
//! transcript. A turn goes `Idle → Sending → Streaming → {Completed, Failed} → Idle`:
//! the user message is committed and persisted as soon as it is sent, while
//! the assistant reply lives in a pending bubble until the relay reports
//! `Done`. A failed turn keeps its bubble (annotated with the failure) but
//! never reaches the history.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client::{ChatTransport, TransportError};
use crate::frame::{FrameError, StreamEvent, decode_stream};
use crate::history::{HistoryStore, KeyValueStore};
use crate::relay::GENERIC_ERROR;
use crate::types::{ChatMessage, ChatRequest, Role};

const CLOSED_EARLY: &str = "Network error: connection closed before the response completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Failed,
}

/// Why a turn ended without an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnFailure {
    /// The relay reported an `error` frame.
    #[error("{0}")]
    Provider(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Malformed(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<FrameError> for TurnFailure {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Malformed(_) => TurnFailure::Malformed(err.to_string()),
            FrameError::Truncated => TurnFailure::Transport(CLOSED_EARLY.to_string()),
            FrameError::Transport(message) => {
                TurnFailure::Transport(format!("Network error: {message}"))
            }
        }
    }
}

impl From<TransportError> for TurnFailure {
    fn from(err: TransportError) -> Self {
        TurnFailure::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(ChatMessage),
    Failed(TurnFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("Input is empty")]
    EmptyInput,

    #[error("A turn is already in progress")]
    TurnInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BubbleStatus {
    Committed,
    Pending,
    Failed(TurnFailure),
}

/// One entry of the visible transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bubble {
    pub role: Role,
    pub text: String,
    pub status: BubbleStatus,
}

impl Bubble {
    fn committed(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            text: message.content.clone(),
            status: BubbleStatus::Committed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == BubbleStatus::Pending
    }

    /// Text as it should be shown, including any failure annotation.
    pub fn display_text(&self) -> String {
        match &self.status {
            BubbleStatus::Failed(failure) if self.text.is_empty() => format!("⚠️ {failure}"),
            BubbleStatus::Failed(failure) => format!("{}\n⚠️ {failure}", self.text),
            _ => self.text.clone(),
        }
    }
}

pub struct ConversationController<T, S> {
    transport: T,
    store: HistoryStore<S>,
    history: Vec<ChatMessage>,
    transcript: Vec<Bubble>,
    state: TurnState,
    system_prompt: Option<String>,
    model: Option<String>,
    greeting: Option<String>,
}

impl<T: ChatTransport, S: KeyValueStore> ConversationController<T, S> {
    /// Load the persisted history and rebuild the transcript from it.
    pub fn new(transport: T, store: HistoryStore<S>) -> Self {
        let history = store.load();
        let transcript = history.iter().map(Bubble::committed).collect();
        Self {
            transport,
            store,
            history,
            transcript,
            state: TurnState::Idle,
            system_prompt: None,
            model: None,
            greeting: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Text shown in place of an empty conversation. Never persisted.
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn greeting(&self) -> Option<&str> {
        if self.transcript.is_empty() {
            self.greeting.as_deref()
        } else {
            None
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn transcript(&self) -> &[Bubble] {
        &self.transcript
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Text accumulated so far for the in-flight reply.
    pub fn pending_text(&self) -> Option<&str> {
        self.transcript
            .last()
            .filter(|bubble| bubble.is_pending())
            .map(|bubble| bubble.text.as_str())
    }

    /// Run one full turn for `input`.
    ///
    /// `on_delta` sees every text fragment as it arrives. Failures of the turn
    /// itself come back as [`TurnOutcome::Failed`]; only a rejected submission
    /// is an `Err`.
    pub async fn submit<F>(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
        mut on_delta: F,
    ) -> Result<TurnOutcome, ControllerError>
    where
        F: FnMut(&str),
    {
        let request = self.append_user(input)?;
        let mut turn = ActiveTurn { chat: self };
        let chat = &mut *turn.chat;
        chat.begin_pending();

        let outcome = match chat.stream_reply(&request, cancel, &mut on_delta).await {
            Ok(()) => TurnOutcome::Completed(chat.commit_pending()),
            Err(failure) => {
                chat.fail_pending(failure.clone());
                TurnOutcome::Failed(failure)
            }
        };
        Ok(outcome)
    }

    /// Commit the user's message and move to `Sending`.
    ///
    /// Returns the snapshot to send: the whole history including the new
    /// message. The user message is never retracted, even if the turn fails.
    pub fn append_user(&mut self, input: &str) -> Result<ChatRequest, ControllerError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ControllerError::EmptyInput);
        }
        if self.state != TurnState::Idle {
            return Err(ControllerError::TurnInProgress);
        }

        let message = ChatMessage::user(text);
        self.transcript.push(Bubble::committed(&message));
        self.history.push(message);
        self.persist();
        self.transition(TurnState::Sending);

        Ok(ChatRequest {
            messages: self.history.clone(),
            system: self.system_prompt.clone(),
        })
    }

    /// Extend the pending reply. Deltas are only ever appended.
    pub fn apply_delta(&mut self, text: &str) {
        if let Some(bubble) = self.transcript.last_mut().filter(|b| b.is_pending()) {
            bubble.text.push_str(text);
        }
    }

    /// Turn the pending reply into a committed assistant message.
    ///
    /// Returns `None` when no reply is in flight.
    pub fn commit_assistant(&mut self) -> Option<ChatMessage> {
        if self.state != TurnState::Streaming {
            return None;
        }
        Some(self.commit_pending())
    }

    /// Mark the pending reply as failed. It stays visible but is not saved.
    pub fn fail_pending(&mut self, failure: TurnFailure) {
        tracing::warn!(%failure, "turn failed");
        if let Some(bubble) = self.transcript.last_mut().filter(|b| b.is_pending()) {
            bubble.status = BubbleStatus::Failed(failure);
        }
        self.transition(TurnState::Failed);
        self.transition(TurnState::Idle);
    }

    /// Drop an abandoned pending reply and return to `Idle`.
    pub fn discard_pending(&mut self) {
        if self.transcript.last().is_some_and(Bubble::is_pending) {
            self.transcript.pop();
        }
        if self.state != TurnState::Idle {
            self.transition(TurnState::Idle);
        }
    }

    /// Forget the whole conversation, persisted and visible.
    pub fn clear(&mut self) -> Result<(), ControllerError> {
        if self.state != TurnState::Idle {
            return Err(ControllerError::TurnInProgress);
        }
        self.history.clear();
        self.transcript.clear();
        if let Err(err) = self.store.clear() {
            tracing::warn!(%err, "failed to clear stored history");
        }
        Ok(())
    }

    /// Open an empty assistant bubble and move to `Streaming`.
    pub fn begin_pending(&mut self) {
        self.transcript.push(Bubble {
            role: Role::Assistant,
            text: String::new(),
            status: BubbleStatus::Pending,
        });
        self.transition(TurnState::Streaming);
    }

    fn commit_pending(&mut self) -> ChatMessage {
        let text = match self.transcript.last_mut().filter(|b| b.is_pending()) {
            Some(bubble) => {
                bubble.status = BubbleStatus::Committed;
                bubble.text.clone()
            }
            None => String::new(),
        };
        let message = ChatMessage::assistant(text);
        self.history.push(message.clone());
        self.persist();
        self.transition(TurnState::Completed);
        self.transition(TurnState::Idle);
        message
    }

    async fn stream_reply<F>(
        &mut self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_delta: &mut F,
    ) -> Result<(), TurnFailure>
    where
        F: FnMut(&str),
    {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(TurnFailure::Cancelled),
            opened = self.transport.open(request, self.model.as_deref()) => opened,
        };
        let mut events = Box::pin(decode_stream(opened?));

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TurnFailure::Cancelled),
                next = events.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::Delta { text })) => {
                    self.apply_delta(&text);
                    on_delta(&text);
                }
                Some(Ok(StreamEvent::Done)) => return Ok(()),
                Some(Ok(StreamEvent::Error { message })) if message.trim().is_empty() => {
                    return Err(TurnFailure::Provider(GENERIC_ERROR.to_string()));
                }
                Some(Ok(StreamEvent::Error { message })) => {
                    return Err(TurnFailure::Provider(message));
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Err(TurnFailure::Transport(CLOSED_EARLY.to_string())),
            }
        }
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.history) {
            tracing::warn!(%err, "failed to persist history");
        }
    }

    fn transition(&mut self, next: TurnState) {
        tracing::debug!(from = ?self.state, to = ?next, "turn state");
        self.state = next;
    }
}

/// Puts the controller back to `Idle` if a turn is dropped before it
/// reaches a terminal state.
struct ActiveTurn<'a, T: ChatTransport, S: KeyValueStore> {
    chat: &'a mut ConversationController<T, S>,
}

impl<T: ChatTransport, S: KeyValueStore> Drop for ActiveTurn<'_, T, S> {
    fn drop(&mut self) {
        if matches!(self.chat.state, TurnState::Sending | TurnState::Streaming) {
            tracing::warn!("turn abandoned before completion");
            self.chat.discard_pending();
        }
    }
}
