//! Conversation turn handling.
//!
//! A [`Conversation`] owns the [`Session`] and drives one turn at a time:
//!
//! ```text
//! Idle -> CheckExpiry -> AppendUserTurn -> Streaming -> Idle
//! ```
//!
//! Every failure is contained here. Callers only see a [`TurnOutcome`].

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::host::VoiceHost;
use crate::llm::{ChatBackend, ChatMessage, ChatRequest, Role, StreamEventStream};
use crate::segmenter::{SpeakableChunk, StreamSegmenter};
use crate::session::Session;
use chrono::{DateTime, Local, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dialog spoken when the user says thanks.
pub const THANKS_DIALOG: &str = "noproblem";

/// Phrases recognised as thanks while the conversation is active.
const THANKS_VOCABULARY: &[&str] = &[
    "thanks",
    "thank you",
    "thanks a lot",
    "many thanks",
    "cheers",
    "much appreciated",
];

/// Result of handling one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model replied and every chunk was spoken.
    Completed,
    /// A canned acknowledgment was spoken instead of calling the model.
    Acknowledged,
    /// The utterance was not for us. Nothing changed.
    Declined,
    /// The turn was cancelled before anything was spoken.
    Cancelled,
    /// The turn was cancelled after at least one chunk was spoken.
    Interrupted,
    /// The backend, the stream or the speech layer failed.
    Failed,
}

impl TurnOutcome {
    /// Whether the host should consider the utterance handled.
    pub fn handled(self) -> bool {
        matches!(self, Self::Completed | Self::Acknowledged | Self::Interrupted)
    }

    fn was_cancelled(self) -> bool {
        matches!(self, Self::Cancelled | Self::Interrupted)
    }
}

/// The active conversation with the language model.
pub struct Conversation {
    config: ChatConfig,
    session: Session,
    backend: Arc<dyn ChatBackend>,
    voice: Arc<dyn VoiceHost>,
    /// Token observed by the current (or next) turn.
    cancel: CancellationToken,
    snippets: Vec<String>,
}

impl Conversation {
    pub fn new(
        config: ChatConfig,
        backend: Arc<dyn ChatBackend>,
        voice: Arc<dyn VoiceHost>,
    ) -> Self {
        let session = Session::new(&config, Utc::now());
        Self {
            config,
            session,
            backend,
            voice,
            cancel: CancellationToken::new(),
            snippets: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Search-result snippets gathered since the last reset.
    pub fn snippets(&self) -> &[String] {
        &self.snippets
    }

    /// Token that interrupts the current turn, or the next one if idle.
    ///
    /// The token is replaced once a turn is cancelled, and a token cancelled
    /// while idle is discarded when the next turn starts. Fetch a fresh handle
    /// before each turn.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Discard the conversation and start over with the current preamble.
    pub fn reset(&mut self) {
        self.reset_at(Utc::now());
    }

    fn reset_at(&mut self, now: DateTime<Utc>) {
        self.session.reset(&self.config, now);
        self.snippets.clear();
    }

    /// Replace the configuration and reset the session.
    pub fn apply_config(&mut self, config: ChatConfig) {
        self.config = config;
        self.reset();
    }

    /// Swap the backend used for subsequent turns.
    pub fn set_backend(&mut self, backend: Arc<dyn ChatBackend>) {
        info!("switching LLM backend to {}", backend.name());
        self.backend = backend;
    }

    /// Handle an utterance routed to us by the fallback chain.
    pub async fn handle_turn(&mut self, utterance: &str) -> TurnOutcome {
        self.handle_turn_at(utterance, Utc::now()).await
    }

    /// Handle an utterance as if it arrived at `now`.
    pub async fn handle_turn_at(&mut self, utterance: &str, now: DateTime<Utc>) -> TurnOutcome {
        if let Err(e) = validate_utterance(utterance) {
            debug!("declining utterance: {e}");
            return TurnOutcome::Declined;
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let turn_id = Uuid::new_v4();

        if self.session.is_expired(now) {
            debug!(
                %turn_id,
                "{}s has run out since {}. Resetting chat.",
                self.config.context_timeout_secs,
                self.session.last_activity()
            );
            self.reset_at(now);
        }

        self.session.trim_to_window();
        self.session.append(Role::User, utterance);

        let outcome = match self.stream_reply(now, turn_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%turn_id, "error while processing chat stream: {e}");
                TurnOutcome::Failed
            }
        };
        if outcome.was_cancelled() {
            self.cancel = CancellationToken::new();
        }
        outcome
    }

    /// Handle an utterance while we hold the active conversation.
    ///
    /// Only thanks are answered here; everything else is declined so the host
    /// can route it normally.
    pub async fn converse(&mut self, utterance: Option<&str>) -> TurnOutcome {
        let Some(utterance) = utterance else {
            return TurnOutcome::Declined;
        };
        if !is_thanks(utterance) {
            return TurnOutcome::Declined;
        }
        match self.voice.speak_dialog(THANKS_DIALOG).await {
            Ok(()) => TurnOutcome::Acknowledged,
            Err(e) => {
                warn!("failed to speak {THANKS_DIALOG} dialog: {e}");
                TurnOutcome::Failed
            }
        }
    }

    /// Preamble with the current date and a reply-language instruction.
    pub(crate) fn decorated_preamble(&self, now: DateTime<Utc>) -> String {
        let stamp = now.with_timezone(&Local).format("%A, %d %b %Y %H:%M:%S");
        format!(
            "{} Current date and time are {stamp}. You reply in the same language as in which \
             you receive the query.",
            self.session.preamble()
        )
    }

    /// The request sent to the backend: history with a decorated preamble.
    pub(crate) fn build_request(&self, now: DateTime<Utc>) -> ChatRequest {
        let messages = std::iter::once(ChatMessage::system(self.decorated_preamble(now)))
            .chain(self.session.history().iter().skip(1).cloned())
            .collect();
        ChatRequest::streaming(self.config.model.clone(), messages)
            .with_connectors(self.config.search_connectors.clone())
    }

    async fn stream_reply(&mut self, now: DateTime<Utc>, turn_id: Uuid) -> Result<TurnOutcome> {
        let request = self.build_request(now);
        info!(
            %turn_id,
            backend = self.backend.name(),
            "sending to LLM: {}",
            request.model
        );

        let cancel = self.cancel.clone();
        let backend = Arc::clone(&self.backend);
        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(%turn_id, "turn cancelled before the stream started");
                return Ok(TurnOutcome::Cancelled);
            }
            result = backend.chat(&request) => result?,
        };

        let mut segmenter = StreamSegmenter::new();
        let result = self
            .drive_stream(stream, &mut segmenter, &cancel, turn_id)
            .await;
        self.snippets.extend(segmenter.into_snippets());
        result
    }

    async fn drive_stream(
        &mut self,
        mut stream: StreamEventStream,
        segmenter: &mut StreamSegmenter,
        cancel: &CancellationToken,
        turn_id: Uuid,
    ) -> Result<TurnOutcome> {
        let mut chunk_count: usize = 0;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(%turn_id, "generation cancelled after {chunk_count} chunks");
                    return Ok(if chunk_count == 0 {
                        TurnOutcome::Cancelled
                    } else {
                        TurnOutcome::Interrupted
                    });
                }
                next = stream.next() => next,
            };

            let ended = next.is_none();
            let chunks = match next {
                Some(Ok(event)) => {
                    debug!(%turn_id, "streaming from {}: {event:?}", self.config.model);
                    segmenter.push(event)
                }
                Some(Err(e)) => return Err(e),
                None => segmenter.finish().into_iter().collect(),
            };

            for chunk in chunks {
                self.speak_chunk(chunk, turn_id).await?;
                chunk_count += 1;
            }

            if ended || segmenter.is_finished() {
                break;
            }
        }

        if !segmenter.snippets().is_empty() {
            info!(%turn_id, "web search found {} docs", segmenter.snippets().len());
        }
        info!(%turn_id, "reply complete in {chunk_count} chunks");
        Ok(TurnOutcome::Completed)
    }

    async fn speak_chunk(&mut self, chunk: SpeakableChunk, turn_id: Uuid) -> Result<()> {
        info!(%turn_id, "speaking: {}", chunk.text);
        self.voice.speak(&chunk.text, chunk.is_final, true).await?;
        self.session.append(Role::Assistant, chunk.text);
        Ok(())
    }
}

fn validate_utterance(utterance: &str) -> Result<()> {
    if utterance.trim().is_empty() {
        return Err(ChatError::EmptyUtterance);
    }
    Ok(())
}

/// Whether `utterance` contains one of the thanks phrases as whole words.
pub(crate) fn is_thanks(utterance: &str) -> bool {
    let normalized: String = utterance
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let padded = format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "));
    THANKS_VOCABULARY
        .iter()
        .any(|phrase| padded.contains(&format!(" {phrase} ")))
}
