//! Server-sent events channel.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::Value;

use super::message::{PushMessage, TopicFilter};
use super::subscriber::{ChannelError, EventChannel, MessageStream};
use crate::command::{RemoteError, map_request_error, reject_status};
use crate::session::SessionContext;

// =============================================================================
// Decoder
// =============================================================================

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, when present.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Longest line the decoder buffers before giving up on the stream.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; only complete lines
/// are interpreted. Lines end with LF or CRLF.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: BytesMut,
    data: Vec<String>,
    event: Option<String>,
    max_line_len: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }
}

impl SseDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder refusing lines longer than `max_line_len` bytes.
    #[must_use]
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            data: Vec::new(),
            event: None,
            max_line_len,
        }
    }

    /// Feeds one chunk, returning the events it completed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Dropped`] once a line grows past the limit;
    /// the stream is unusable after that.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, ChannelError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            self.check_line_len(end)?;
            let line = self.buffer.split_to(end);
            self.buffer.advance(1);
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(line.strip_suffix('\r').unwrap_or(&line)) {
                events.push(event);
            }
        }
        self.check_line_len(self.buffer.len())?;
        Ok(events)
    }

    fn check_line_len(&mut self, len: usize) -> Result<(), ChannelError> {
        if len <= self.max_line_len {
            return Ok(());
        }
        self.buffer.clear();
        Err(ChannelError::Dropped(format!(
            "event stream line exceeds {} bytes",
            self.max_line_len
        )))
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event,
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Interprets an event as a push message.
///
/// The JSON payload's `type` wins; otherwise a named event (other than the
/// default `message`) supplies the topic. Anything else is skipped.
fn decode_message(event: SseEvent) -> Option<PushMessage> {
    let payload: Value = match serde_json::from_str(&event.data) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "skipping malformed push payload");
            return None;
        }
    };
    if payload.get("type").is_some_and(Value::is_string) {
        return match serde_json::from_value(payload) {
            Ok(message) => Some(message),
            Err(error) => {
                tracing::warn!(%error, "skipping malformed push message");
                None
            }
        };
    }
    match event.event {
        Some(topic) if topic != "message" => Some(PushMessage::new(topic, payload)),
        _ => {
            tracing::warn!("skipping push payload without a topic");
            None
        }
    }
}

// =============================================================================
// SSE Channel
// =============================================================================

/// [`EventChannel`] over `GET <events url>` with `Accept: text/event-stream`.
///
/// A 401 rejection invalidates the session, like any unauthorized command.
#[derive(Clone)]
pub struct SseChannel {
    client: reqwest::Client,
    url: String,
    session: Arc<SessionContext>,
}

impl fmt::Debug for SseChannel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SseChannel")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl SseChannel {
    /// Creates a channel for the stream at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, session: Arc<SessionContext>) -> Self {
        Self::with_client(reqwest::Client::new(), url, session)
    }

    /// Creates a channel sharing an existing client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        url: impl Into<String>,
        session: Arc<SessionContext>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            session,
        }
    }
}

impl EventChannel for SseChannel {
    fn connect(
        &self,
        filter: &TopicFilter,
    ) -> BoxFuture<'static, Result<MessageStream, ChannelError>> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .query(&filter.query());
        if let Some(token) = self.session.bearer_token() {
            request = request.bearer_auth(token);
        }
        let session = Arc::clone(&self.session);

        async move {
            let response = request
                .send()
                .await
                .map_err(|error| ChannelError::Connect(map_request_error(error).to_string()))?;
            if !response.status().is_success() {
                return Err(match reject_status(response).await {
                    RemoteError::Status { status, message } => {
                        if status == 401 {
                            session.invalidate();
                        }
                        ChannelError::Rejected { status, message }
                    }
                    other => ChannelError::Connect(other.to_string()),
                });
            }

            let mut decoder = SseDecoder::new();
            let messages = response.bytes_stream().flat_map(move |chunk| {
                let items: Vec<Result<PushMessage, ChannelError>> =
                    match chunk.map_err(|error| ChannelError::Dropped(error.to_string())) {
                        Ok(bytes) => match decoder.push(&bytes) {
                            Ok(events) => {
                                events.into_iter().filter_map(decode_message).map(Ok).collect()
                            }
                            Err(error) => vec![Err(error)],
                        },
                        Err(error) => vec![Err(error)],
                    };
                futures::stream::iter(items)
            });
            Ok(messages.boxed())
        }
        .boxed()
    }
}
