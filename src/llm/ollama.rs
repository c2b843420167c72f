//! Ollama native chat backend.
//!
//! Ollama streams `/api/chat` replies as newline-delimited JSON, one object
//! per generated fragment:
//!
//! ```text
//! {"message":{"role":"assistant","content":"The"},"done":false}
//! {"message":{"role":"assistant","content":" blue"},"done":false}
//! {"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop"}
//! ```
//!
//! The `done: true` line becomes the final [`StreamEvent::Token`].

use super::{ChatBackend, ChatRequest, Document, StreamEvent, StreamEventStream};
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, info};

/// Streaming client for an Ollama server.
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OllamaBackend {
    /// Create a backend for the given server URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("cannot build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        info!("Ollama backend configured: {base_url}");
        Ok(Self { base_url, client })
    }

    /// Create a backend from the `host` and `connect_timeout_secs` settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        Self::new(
            config.host.as_str(),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Build the JSON body for `/api/chat`.
pub(crate) fn build_chat_body(request: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect();

    serde_json::json!({
        "model": request.model,
        "messages": messages,
        "keep_alive": request.keep_alive,
        "stream": request.stream,
    })
}

/// Extract an error message from an Ollama error response body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_owned())
}

/// Parse one NDJSON line into an event.
///
/// Returns `Ok(None)` for blank lines and for non-final lines with no content.
pub(crate) fn parse_chat_line(line: &str) -> Result<Option<StreamEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ChatError::Stream(format!("failed to parse NDJSON: {e}")))?;

    if let Some(error) = chunk.get("error").and_then(|e| e.as_str()) {
        return Err(ChatError::Stream(format!("backend error: {error}")));
    }

    if let Some(docs) = chunk.get("documents").and_then(|d| d.as_array()) {
        let documents = docs
            .iter()
            .filter_map(|d| serde_json::from_value::<Document>(d.clone()).ok())
            .collect();
        return Ok(Some(StreamEvent::SearchResults { documents }));
    }

    let text = chunk["message"]["content"].as_str().unwrap_or_default();
    let is_final = chunk["done"].as_bool().unwrap_or(false);
    if text.is_empty() && !is_final {
        return Ok(None);
    }

    Ok(Some(StreamEvent::Token {
        text: text.to_owned(),
        is_final,
    }))
}

/// Splits a byte stream into complete lines.
///
/// Buffers raw bytes so multi-byte characters split across network chunks
/// decode correctly.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Push a chunk and return every line it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// Return the unterminated tail, if any.
    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

/// Turn the raw response body into a stream of events.
///
/// The stream ends after the `done` line, after the first error, or when the
/// body ends.
pub(crate) fn event_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<StreamEvent>> + Send {
    async_stream::stream! {
        let mut lines = LineBuffer::default();
        let mut byte_stream = std::pin::pin!(byte_stream);
        let mut ended = false;

        'read: while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(ChatError::Stream(format!("stream read error: {e}")));
                    ended = true;
                    break;
                }
            };

            for line in lines.push(&bytes) {
                match parse_chat_line(&line) {
                    Ok(Some(event)) => {
                        let done = matches!(event, StreamEvent::Token { is_final: true, .. });
                        yield Ok(event);
                        if done {
                            ended = true;
                            break 'read;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        ended = true;
                        break 'read;
                    }
                }
            }
        }

        // A body without a trailing newline still ends on a complete line.
        let tail = if ended { None } else { lines.flush() };
        if let Some(tail) = tail {
            match parse_chat_line(&tail) {
                Ok(Some(event)) => yield Ok(event),
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<StreamEventStream> {
        let url = format!("{}/api/chat", self.base_url);
        let body = build_chat_body(request);
        if !request.connectors.is_empty() {
            debug!(
                connectors = ?request.connectors,
                "Ollama has no search connectors; ignoring"
            );
        }

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::BackendConnection(format!("Ollama request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ChatError::BackendConnection(format!(
                "Ollama HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&body_text)
            )));
        }

        Ok(Box::pin(event_stream(response.bytes_stream())))
    }
}
