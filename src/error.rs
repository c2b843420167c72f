//! Error types for the conversation engine.

/// Top-level error type for the fallback chat handler.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The LLM backend could not be reached or rejected the request.
    #[error("backend connection error: {0}")]
    BackendConnection(String),

    /// The backend stream broke or produced an unreadable event.
    #[error("stream error: {0}")]
    Stream(String),

    /// Language detection request failed.
    #[error("language detection error: {0}")]
    Detection(String),

    /// Language detection endpoint answered without a usable language code.
    #[error("malformed language detection response: {0}")]
    MalformedDetectionResponse(String),

    /// The utterance was empty after trimming.
    #[error("utterance is empty")]
    EmptyUtterance,

    /// The host speech layer refused a chunk.
    #[error("speech error: {0}")]
    Speech(String),

    /// Fallback chain registration failed.
    #[error("fallback registration error: {0}")]
    Registration(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChatError>;
