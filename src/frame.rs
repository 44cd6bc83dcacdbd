//! Wire framing for the relay's event stream.
//!
//! Every event travels as one `data: <json>\n\n` frame. The server encodes
//! frames with [`encode`]; clients feed raw response bytes into a
//! [`FrameDecoder`] (or wrap a whole byte stream with [`decode_stream`]) and
//! get the events back in order, however the transport split the bytes.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

const DATA_PREFIX: &str = "data:";
const FRAME_DELIMITER: &str = "\n\n";

/// One semantic event of an assistant turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Delta { text: String },
    Done,
    Error { message: String },
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// `Done` and `Error` end a stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("stream ended inside an unterminated frame")]
    Truncated,

    #[error("{0}")]
    Transport(String),
}

/// Encode a single event as one self-delimited wire frame.
pub fn encode(event: &StreamEvent) -> Bytes {
    let payload = match event {
        StreamEvent::Delta { text } => json!({ "delta": text }),
        StreamEvent::Done => json!({ "done": true }),
        StreamEvent::Error { message } => json!({ "error": message }),
    };
    Bytes::from(format!("{DATA_PREFIX} {payload}{FRAME_DELIMITER}"))
}

// Shape accepted on the way in; which key is present picks the variant.
#[derive(Deserialize)]
struct IncomingFrame {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across two reads is held back until the rest
/// of it arrives. Byte sequences that can never become valid UTF-8 are
/// replaced with U+FFFD instead of failing the whole stream.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as is complete.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Flush whatever is still held back once the input has ended.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Stateful frame parser fed with arbitrarily sized byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    utf8: Utf8Buffer,
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let text = self.utf8.decode(chunk);
        self.buffer.push_str(&text);
    }

    /// Pop the next complete event, if a full frame is buffered.
    pub fn next_event(&mut self) -> Option<Result<StreamEvent, FrameError>> {
        loop {
            let end = self.buffer.find(FRAME_DELIMITER)?;
            let frame: String = self.buffer.drain(..end + FRAME_DELIMITER.len()).collect();
            match parse_frame(&frame[..end]) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }

    /// Check that the input ended on a frame boundary.
    pub fn finish(&mut self) -> Result<(), FrameError> {
        let tail = self.utf8.finish();
        self.buffer.push_str(&tail);
        if self.buffer.trim().is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated)
        }
    }
}

fn parse_frame(frame: &str) -> Result<Option<StreamEvent>, FrameError> {
    // Blank frames and SSE comments (keep-alives) carry no event.
    if frame.trim().is_empty() || frame.lines().all(|line| line.starts_with(':')) {
        return Ok(None);
    }

    let payload = frame
        .strip_prefix(DATA_PREFIX)
        .ok_or_else(|| FrameError::Malformed(format!("missing `{DATA_PREFIX}` prefix")))?;
    let parsed: IncomingFrame = serde_json::from_str(payload.trim())
        .map_err(|err| FrameError::Malformed(err.to_string()))?;

    if let Some(text) = parsed.delta {
        return Ok(Some(StreamEvent::Delta { text }));
    }
    if parsed.done == Some(true) {
        return Ok(Some(StreamEvent::Done));
    }
    if let Some(message) = parsed.error {
        return Ok(Some(StreamEvent::Error { message }));
    }
    Err(FrameError::Malformed(
        "frame carries none of `delta`, `done` or `error`".to_string(),
    ))
}

/// Turn a raw response body into a lazy sequence of events.
///
/// The sequence ends after the first terminal event, after the first error,
/// or when the body ends. A body that ends mid-frame yields
/// [`FrameError::Truncated`].
pub fn decode_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamEvent, FrameError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = FrameDecoder::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => decoder.push(chunk.as_ref()),
                Err(err) => {
                    yield Err(FrameError::Transport(err.to_string()));
                    return;
                }
            }

            while let Some(item) = decoder.next_event() {
                let keep_going = matches!(&item, Ok(event) if !event.is_terminal());
                yield item;
                if !keep_going {
                    return;
                }
            }
        }

        if let Err(err) = decoder.finish() {
            yield Err(err);
        }
    }
}
