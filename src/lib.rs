//! Ollama chat: a conversational fallback handler for voice assistants.
//!
//! When no intent matches an utterance, the host hands it to this crate.
//! The utterance is sent to an Ollama model together with the conversation so
//! far, and the streamed reply is spoken back phrase by phrase:
//! Utterance → Session → LLM stream → Segmenter → Speech
//!
//! # Architecture
//!
//! - **Router**: registers in the host fallback chain and filters artifacts
//! - **Dispatcher**: runs one conversation turn and contains every failure
//! - **Session**: message history with a preamble and an expiry clock
//! - **Segmenter**: turns tokens into speakable sentences with one-token lookahead
//! - **LLM**: the backend trait and the Ollama NDJSON client
//! - **Language detection**: best-effort tagging through a fastText service

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod lang_detect;
pub mod llm;
pub mod router;
pub mod segmenter;
pub mod session;

#[doc(hidden)]
pub mod test_utils;

pub use config::ChatConfig;
pub use dispatcher::{Conversation, TurnOutcome};
pub use error::{ChatError, Result};
pub use host::{FallbackRegistry, MessageContext, VoiceHost};
pub use lang_detect::LanguageDetector;
pub use router::FallbackRouter;
pub use segmenter::{SpeakableChunk, StreamSegmenter};
pub use session::Session;
