use super::{CompletionRequest, LlmBackend, ProviderError, ProviderResult, TextStream};
use crate::frame::Utf8Buffer;
use crate::types::{ChatMessage, Role};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use rig::client::CompletionClient;
use rig::completion::Chat;
use rig::message::Message;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini backend.
///
/// Streaming goes straight to the `streamGenerateContent` SSE endpoint so each
/// provider chunk can be relayed as soon as it arrives. One-shot completions go
/// through rig's Gemini agent.
pub struct GeminiBackend {
    client: Client,
    api_key: String,
    api_base: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn stream_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:streamGenerateContent", self.api_base)
    }
}

// -----------------
// Request shapes
// -----------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<Content<'_>> {
    messages
        .iter()
        .map(|msg| Content {
            role: Some(match msg.role {
                Role::User => "user",
                Role::Assistant => "model",
            }),
            parts: vec![Part { text: &msg.content }],
        })
        .collect()
}

impl<'a> GenerateContentRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        Self {
            contents: to_gemini_contents(&request.messages),
            system_instruction: request
                .system
                .as_deref()
                .filter(|system| !system.is_empty())
                .map(|system| Content {
                    role: None,
                    parts: vec![Part { text: system }],
                }),
        }
    }
}

// -----------------
// Response shapes (exported parser for tests)
// -----------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

/// Parse the `data:` payload of one provider SSE event.
///
/// `None` means the event carries nothing (blank keep-alive). An `Err` is a
/// provider-side failure reported inside the stream.
pub fn parse_gemini_sse_data(data: &str) -> Option<ProviderResult<String>> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = match serde_json::from_str::<GenerateContentResponse>(trimmed) {
        Ok(parsed) => parsed,
        Err(err) => {
            return Some(Err(ProviderError::new(format!(
                "malformed provider response: {err}"
            ))));
        }
    };

    if let Some(error) = parsed.error {
        return Some(Err(ProviderError::new(error.message)));
    }
    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        let message = format!("prompt blocked: {reason}");
        return Some(Err(ProviderError::new(message)));
    }

    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    Some(Ok(text))
}

fn api_error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!("Gemini error {status}: {}", envelope.error.message),
        Err(_) => format!("Gemini error {status}: {body}"),
    }
}

/// Split a provider SSE body into text chunks.
fn sse_text_stream<S>(bytes: S) -> impl Stream<Item = ProviderResult<String>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut utf8 = Utf8Buffer::new();
        let mut buffer = String::new();
        let mut data_acc: Option<String> = None;

        while let Some(item) = bytes.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(ProviderError::from(err));
                    return;
                }
            };
            buffer.push_str(&utf8.decode(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let mut line: String = buffer.drain(..=pos).collect();
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }

                if line.is_empty() {
                    // End of event
                    let event = data_acc.take().and_then(|data| parse_gemini_sse_data(&data));
                    if let Some(result) = event {
                        let failed = result.is_err();
                        yield result;
                        if failed {
                            return;
                        }
                    }
                    continue;
                }

                if let Some(rest) = line.strip_prefix("data:") {
                    let fragment = rest.trim_start();
                    match &mut data_acc {
                        Some(existing) => existing.push_str(fragment),
                        None => data_acc = Some(fragment.to_string()),
                    }
                }
            }
        }

        // The final event may not be followed by a blank line.
        if let Some(result) = data_acc.take().and_then(|data| parse_gemini_sse_data(&data)) {
            yield result;
        }
    }
}

fn to_rig_message(msg: &ChatMessage) -> Message {
    match msg.role {
        Role::User => Message::user(&msg.content),
        Role::Assistant => Message::assistant(&msg.content),
    }
}

/// Split a conversation into rig's prompt and the history before it. The
/// prompt keeps the role of the last message.
fn to_rig_prompt(messages: &[ChatMessage]) -> ProviderResult<(Message, Vec<Message>)> {
    let Some((last, history)) = messages.split_last() else {
        return Err(ProviderError::new("No messages provided"));
    };
    let history = history.iter().map(to_rig_message).collect();
    Ok((to_rig_message(last), history))
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    async fn complete(&self, request: &CompletionRequest) -> ProviderResult<String> {
        let (prompt, history) = to_rig_prompt(&request.messages)?;
        let client = rig::providers::gemini::Client::new(&self.api_key);
        let mut builder = client.agent(&request.model);
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.preamble(system);
        }
        let agent = builder.build();

        Ok(agent.chat(prompt, history).await?)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &CompletionRequest) -> ProviderResult<TextStream> {
        let response = self
            .client
            .post(self.stream_url(&request.model))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .header("accept", "text/event-stream")
            .json(&GenerateContentRequest::from_request(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(api_error_message(status, &body)));
        }

        tracing::debug!(model = %request.model, "provider stream opened");
        Ok(sse_text_stream(response.bytes_stream()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn parses_gemini_data() {
        assert!(parse_gemini_sse_data("").is_none());
        assert_eq!(
            parse_gemini_sse_data(
                r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#
            ),
            Some(Ok("Hello".to_string()))
        );
        assert_eq!(
            parse_gemini_sse_data(r#"{"candidates":[{"finishReason":"STOP"}]}"#),
            Some(Ok(String::new()))
        );
        assert_eq!(
            parse_gemini_sse_data(r#"{"error":{"code":429,"message":"rate limited"}}"#),
            Some(Err(ProviderError::new("rate limited")))
        );
        assert!(matches!(
            parse_gemini_sse_data(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#),
            Some(Err(_))
        ));
        assert!(matches!(parse_gemini_sse_data("{oops"), Some(Err(_))));
    }

    #[test]
    fn maps_roles_and_system_instruction() {
        let request = CompletionRequest {
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            system: Some("be brief".to_string()),
            model: "gemini-2.0-flash".to_string(),
        };
        let contents = GenerateContentRequest::from_request(&request);
        let body = serde_json::to_value(contents).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                ],
                "systemInstruction": {"parts": [{"text": "be brief"}]},
            })
        );
    }

    #[test]
    fn rig_prompt_keeps_last_role() {
        let messages = [ChatMessage::user("hi"), ChatMessage::assistant("Hel")];
        let (prompt, history) = to_rig_prompt(&messages).unwrap();
        assert!(matches!(prompt, Message::Assistant { .. }));
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], Message::User { .. }));
        assert!(to_rig_prompt(&[]).is_err());
    }

    #[test]
    fn extracts_error_message_from_envelope() {
        let message = api_error_message(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"code":429,"message":"quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert!(message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn splits_provider_events_across_reads() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Grüß\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" dich\"}]}}]}\n\n",
        );
        let bytes = body.as_bytes();
        // Split inside the two-byte "ü".
        let cut = body.find('ü').unwrap() + 1;
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..cut])),
            Ok(Bytes::copy_from_slice(&bytes[cut..])),
        ];

        let pieces: Vec<_> = sse_text_stream(stream::iter(chunks)).collect().await;
        assert_eq!(
            pieces,
            vec![Ok("Grüß".to_string()), Ok(" dich".to_string())]
        );
    }
}
