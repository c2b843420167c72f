//! Language model backend contract.
//!
//! A backend turns an ordered message history into a lazy, finite stream of
//! [`StreamEvent`]s. The conversation engine never sees HTTP or wire formats;
//! it only matches on events.
//!
//! - [`ollama::OllamaBackend`]: Ollama's native `/api/chat` NDJSON stream.

pub mod ollama;

pub use ollama::OllamaBackend;

use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Who authored a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instruction text (the preamble).
    System,
    /// The person speaking to the assistant.
    User,
    /// The model.
    Assistant,
}

impl Role {
    /// Wire name used by chat APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A retrieved document attached to a generation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    /// Short excerpt suitable for grounding follow-up turns.
    pub snippet: String,
    pub title: Option<String>,
    pub url: Option<String>,
}

/// A normalized event from a streaming backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of generated text.
    Token {
        text: String,
        /// Whether this is the last token of the reply.
        is_final: bool,
    },
    /// Documents found by a backend-side search. Never spoken.
    SearchResults { documents: Vec<Document> },
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_token(text: impl Into<String>) -> Self {
        Self::Token {
            text: text.into(),
            is_final: true,
        }
    }
}

/// A streaming chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// How long the backend keeps the model loaded. `-1` never unloads.
    pub keep_alive: i64,
    pub stream: bool,
    /// Search connectors for backends that support retrieval.
    pub connectors: Vec<String>,
}

impl ChatRequest {
    /// Build a streaming request that keeps the model resident.
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            keep_alive: -1,
            stream: true,
            connectors: Vec::new(),
        }
    }

    pub fn with_connectors(mut self, connectors: Vec<String>) -> Self {
        self.connectors = connectors;
        self
    }
}

/// A boxed stream of backend events.
pub type StreamEventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// A streaming LLM backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Start a generation.
    ///
    /// Connection failures surface here; failures after the first byte arrive
    /// as `Err` items in the stream.
    async fn chat(&self, request: &ChatRequest) -> Result<StreamEventStream>;
}
