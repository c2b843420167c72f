//! Token-to-sentence segmentation for streaming speech.
//!
//! The segmenter consumes backend [`StreamEvent`]s and emits
//! [`SpeakableChunk`]s: short phrases that end on sentence punctuation, or
//! after [`MAX_PHRASE_TOKENS`] tokens when the model never punctuates.
//!
//! Each token is held for one step before it is processed. Knowing the next
//! event tells us whether the held token is the last one, which the speech
//! layer needs to decide whether to listen for a follow-up.

use crate::llm::{Document, StreamEvent};

/// A phrase is flushed once it holds more than this many tokens.
pub const MAX_PHRASE_TOKENS: usize = 20;

/// A phrase ready to be spoken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakableChunk {
    /// Phrase text exactly as generated (not trimmed).
    pub text: String,
    /// Whether this is the last phrase of the reply.
    pub is_final: bool,
}

/// Phrase accumulator between flushes.
#[derive(Debug, Default)]
struct PendingPhrase {
    buffer: String,
    token_count: usize,
    saw_sentence_boundary: bool,
}

impl PendingPhrase {
    fn take(&mut self, is_final: bool) -> Option<SpeakableChunk> {
        let text = std::mem::take(&mut self.buffer);
        self.token_count = 0;
        self.saw_sentence_boundary = false;
        if text.is_empty() {
            return None;
        }
        Some(SpeakableChunk { text, is_final })
    }
}

/// Whether a token carries sentence-ending punctuation.
pub(crate) fn has_sentence_terminator(text: &str) -> bool {
    text.contains(['.', '?', '!', '\n'])
}

/// Lookahead-by-one stream segmenter.
///
/// One instance per reply. Feed events with [`push`](Self::push) and call
/// [`finish`](Self::finish) when the stream ends.
#[derive(Debug, Default)]
pub struct StreamSegmenter {
    /// The token waiting for its successor.
    pending: Option<String>,
    phrase: PendingPhrase,
    snippets: Vec<String>,
    finished: bool,
}

impl StreamSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event and return the chunks it completed, in order.
    ///
    /// A final token ends the reply: the held token and the final one are
    /// processed immediately. An empty final token (a bare end marker) is
    /// dropped, so the held token becomes the last one.
    pub fn push(&mut self, event: StreamEvent) -> Vec<SpeakableChunk> {
        if self.finished {
            return Vec::new();
        }

        match event {
            StreamEvent::SearchResults { documents } => {
                self.collect_snippets(documents);
                Vec::new()
            }
            StreamEvent::Token { text, is_final } => {
                let mut chunks = Vec::new();
                if is_final {
                    self.finished = true;
                    let end_marker = text.is_empty();
                    if let Some(held) = self.pending.take() {
                        chunks.extend(self.process(&held, end_marker));
                    }
                    if !end_marker {
                        chunks.extend(self.process(&text, true));
                    } else {
                        // Anything still buffered belongs to the last phrase.
                        chunks.extend(self.phrase.take(true));
                    }
                } else if let Some(held) = self.pending.replace(text) {
                    chunks.extend(self.process(&held, false));
                }
                chunks
            }
        }
    }

    /// Flush whatever is still held when the stream ends without a final token.
    pub fn finish(&mut self) -> Option<SpeakableChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        match self.pending.take() {
            Some(held) => self.process(&held, true),
            None => self.phrase.take(true),
        }
    }

    /// Whether the reply has ended, either by a final token or by [`finish`](Self::finish).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Snippets gathered from search-result events so far.
    pub fn snippets(&self) -> &[String] {
        &self.snippets
    }

    /// Consume the segmenter, returning the gathered snippets.
    pub fn into_snippets(self) -> Vec<String> {
        self.snippets
    }

    fn collect_snippets(&mut self, documents: Vec<Document>) {
        self.snippets.extend(
            documents
                .into_iter()
                .map(|d| d.snippet)
                .filter(|s| !s.is_empty()),
        );
    }

    /// Add one token to the phrase and flush if a flush condition holds.
    fn process(&mut self, token: &str, is_last: bool) -> Option<SpeakableChunk> {
        // A terminator opening a phrase does not end it.
        if has_sentence_terminator(token) && self.phrase.token_count > 0 {
            self.phrase.saw_sentence_boundary = true;
        }
        self.phrase.token_count += 1;
        self.phrase.buffer.push_str(token);

        if self.phrase.token_count > MAX_PHRASE_TOKENS
            || is_last
            || self.phrase.saw_sentence_boundary
        {
            return self.phrase.take(is_last);
        }
        None
    }
}
