//! Configuration for the fallback chat handler.
//!
//! Mirrors the settings surface a voice-assistant host exposes for the skill.
//! Every field has a default, so a partial TOML file (or none at all) yields a
//! usable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default system-role instruction text.
pub const DEFAULT_PREAMBLE: &str = "Your name is Jarvis. You are a helpful language model.";

/// Top-level configuration for the chat handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Position in the host fallback chain. Lower values run earlier.
    pub priority: i32,
    /// Base URL of the Ollama server.
    pub host: String,
    /// Base URL of the fastText language detection service.
    ///
    /// Empty disables language detection.
    pub fasttext_url: String,
    /// Idle seconds after which the conversation is discarded.
    #[serde(alias = "context_timeout")]
    pub context_timeout_secs: u64,
    /// System-role text sent as the first history entry.
    pub preamble: String,
    /// Model name requested from the backend.
    pub model: String,
    /// Search connectors forwarded to backends that support retrieval.
    pub search_connectors: Vec<String>,
    /// Whether raw utterances are intercepted for language tagging before
    /// intent routing.
    pub handle_utterance: bool,
    /// Maximum number of history messages to retain (excluding the preamble).
    ///
    /// Set to 0 to disable trimming.
    pub max_history_messages: usize,
    /// Connect timeout for the backend HTTP client, in seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for a single language detection request, in seconds.
    pub detect_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            priority: 90,
            // Ollama default endpoint.
            host: "http://localhost:11434".to_owned(),
            fasttext_url: String::new(),
            context_timeout_secs: 600,
            preamble: DEFAULT_PREAMBLE.to_owned(),
            model: "phi3".to_owned(),
            search_connectors: Vec::new(),
            handle_utterance: false,
            max_history_messages: 48,
            connect_timeout_secs: 10,
            detect_timeout_secs: 5,
        }
    }
}

impl ChatConfig {
    /// Idle duration after which the session expires.
    pub fn context_timeout(&self) -> Duration {
        Duration::from_secs(self.context_timeout_secs)
    }

    /// Whether language detection is configured.
    pub fn detection_enabled(&self) -> bool {
        !self.fasttext_url.trim().is_empty()
    }

    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::ChatError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ChatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/ollama-chat/config.toml`.
    ///
    /// Override the directory with `OLLAMA_CHAT_CONFIG_DIR`.
    pub fn default_config_path() -> PathBuf {
        config_dir().join("config.toml")
    }
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("OLLAMA_CHAT_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("ollama-chat"))
        .unwrap_or_else(|| PathBuf::from("/tmp/ollama-chat-config"))
}
