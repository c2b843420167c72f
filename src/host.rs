//! Contracts required of the voice-assistant host.
//!
//! The host owns speech recognition, text-to-speech, dialog files and the
//! fallback chain. This crate only calls into it through these traits.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Per-utterance context dictionary passed along with a host message.
///
/// The language tagger writes the detected language under [`LANG_KEY`].
pub type MessageContext = HashMap<String, serde_json::Value>;

/// Context key holding the detected language tag.
pub const LANG_KEY: &str = "lang";

/// Speech output primitives.
#[async_trait]
pub trait VoiceHost: Send + Sync {
    /// Speak `text`.
    ///
    /// `expect_response` asks the host to listen for a follow-up once the
    /// text has been spoken. `wait` blocks until playback completes.
    async fn speak(&self, text: &str, expect_response: bool, wait: bool) -> Result<()>;

    /// Speak a named dialog from the host's locale files (e.g. `"noproblem"`).
    async fn speak_dialog(&self, name: &str) -> Result<()>;
}

/// Host-wide, priority-ordered chain of fallback handlers.
///
/// Handlers with a lower priority value are consulted earlier. The exact
/// ordering rules belong to the host.
pub trait FallbackRegistry: Send + Sync {
    /// Register `handler` at `priority`, replacing any earlier registration.
    fn register_fallback(&self, handler: &str, priority: i32) -> Result<()>;

    /// Remove `handler` from the chain. Removing an unknown handler is a no-op.
    fn remove_fallback(&self, handler: &str) -> Result<()>;
}
