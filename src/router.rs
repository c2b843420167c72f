//! Fallback-chain integration.
//!
//! [`FallbackRouter`] is the handler the host consults when no intent matched.
//! It owns the [`Conversation`], keeps the handler registered at the
//! configured priority and tags raw utterances with their language.

use crate::config::ChatConfig;
use crate::dispatcher::{Conversation, TurnOutcome};
use crate::error::Result;
use crate::host::{FallbackRegistry, LANG_KEY, MessageContext, VoiceHost};
use crate::lang_detect::LanguageDetector;
use crate::llm::{ChatBackend, OllamaBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name under which the handler registers with the host.
pub const HANDLER_ID: &str = "ollama-chat";

/// Utterance produced by microphone noise. Never sent to the model.
pub const MIC_ARTIFACT: &str = "the";

/// Builds a backend for a configuration.
pub type BackendFactory = Box<dyn Fn(&ChatConfig) -> Result<Arc<dyn ChatBackend>> + Send + Sync>;

/// The fallback handler.
pub struct FallbackRouter {
    conversation: Conversation,
    registry: Arc<dyn FallbackRegistry>,
    detector: Option<LanguageDetector>,
    /// Priority at which we are currently registered.
    registered_priority: Option<i32>,
    /// Rebuilds the backend when its connection settings change.
    backend_factory: Option<BackendFactory>,
}

impl FallbackRouter {
    /// Create a router over an existing backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the language detector client cannot be built.
    pub fn new(
        config: ChatConfig,
        backend: Arc<dyn ChatBackend>,
        voice: Arc<dyn VoiceHost>,
        registry: Arc<dyn FallbackRegistry>,
    ) -> Result<Self> {
        let detector = build_detector(&config)?;
        Ok(Self {
            conversation: Conversation::new(config, backend, voice),
            registry,
            detector,
            registered_priority: None,
            backend_factory: None,
        })
    }

    /// Create a router talking to the Ollama server named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config(
        config: ChatConfig,
        voice: Arc<dyn VoiceHost>,
        registry: Arc<dyn FallbackRegistry>,
    ) -> Result<Self> {
        let factory: BackendFactory = Box::new(|config: &ChatConfig| {
            let backend: Arc<dyn ChatBackend> = Arc::new(OllamaBackend::from_config(config)?);
            Ok(backend)
        });
        Self::with_backend_factory(config, factory, voice, registry)
    }

    /// Create a router whose backend is built, and rebuilt on host changes,
    /// by `factory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory or the detector client fails.
    pub fn with_backend_factory(
        config: ChatConfig,
        factory: BackendFactory,
        voice: Arc<dyn VoiceHost>,
        registry: Arc<dyn FallbackRegistry>,
    ) -> Result<Self> {
        let backend = factory(&config)?;
        let mut router = Self::new(config, backend, voice, registry)?;
        router.backend_factory = Some(factory);
        Ok(router)
    }

    /// Register with the fallback chain at the configured priority.
    ///
    /// # Errors
    ///
    /// Returns an error if the host rejects the registration.
    pub fn initialize(&mut self) -> Result<()> {
        let priority = self.config().priority;
        self.registry.register_fallback(HANDLER_ID, priority)?;
        self.registered_priority = Some(priority);
        info!(
            priority,
            model = %self.config().model,
            detection = self.detector.is_some(),
            "registered {HANDLER_ID} fallback"
        );
        Ok(())
    }

    /// Handle an utterance no intent matched. Returns whether it was handled.
    pub async fn handle_fallback(&mut self, utterance: &str) -> bool {
        if utterance == MIC_ARTIFACT {
            debug!("ignoring mic artifact utterance");
            return false;
        }
        self.conversation.handle_turn(utterance).await.handled()
    }

    /// Handle an utterance while our conversation is active.
    pub async fn converse(&mut self, utterance: Option<&str>) -> bool {
        self.conversation.converse(utterance).await == TurnOutcome::Acknowledged
    }

    /// Tag the utterance context with the detected language.
    ///
    /// Does nothing unless utterance handling is enabled and a detector is
    /// configured. Only the first transcription is inspected.
    pub async fn handle_utterance(&self, utterances: &[String], context: &mut MessageContext) {
        if !self.config().handle_utterance {
            return;
        }
        let (Some(detector), Some(first)) = (&self.detector, utterances.first()) else {
            return;
        };
        let lang = detector.detect(first).await;
        debug!("tagging utterance with lang {lang}");
        context.insert(LANG_KEY.to_owned(), serde_json::Value::String(lang));
    }

    /// Apply new settings.
    ///
    /// The session is reset. If the priority changed while registered, the
    /// handler is removed and registered again at the new priority. Clients
    /// are built before anything is replaced, so a build failure leaves the
    /// previous settings in effect.
    ///
    /// # Errors
    ///
    /// Returns an error if a client cannot be built or re-registration fails.
    pub fn on_settings_changed(&mut self, config: ChatConfig) -> Result<()> {
        let detector = build_detector(&config)?;

        let previous = self.config();
        let backend_changed = previous.host != config.host
            || previous.connect_timeout_secs != config.connect_timeout_secs;
        let backend = match &self.backend_factory {
            Some(factory) if backend_changed => Some(factory(&config)?),
            _ => None,
        };

        self.detector = detector;
        if let Some(backend) = backend {
            info!("Ollama host changed to {}", config.host);
            self.conversation.set_backend(backend);
        }
        let new_priority = config.priority;
        self.conversation.apply_config(config);

        if let Some(current) = self.registered_priority
            && current != new_priority
        {
            info!(
                "priority setting has changed from {current} to {new_priority}. Resetting fallback"
            );
            self.registry.remove_fallback(HANDLER_ID)?;
            self.registered_priority = None;
            self.registry.register_fallback(HANDLER_ID, new_priority)?;
            self.registered_priority = Some(new_priority);
        }
        Ok(())
    }

    /// Leave the fallback chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the host rejects the removal.
    pub fn shutdown(&mut self) -> Result<()> {
        self.conversation.cancel_handle().cancel();
        if self.registered_priority.take().is_some() {
            self.registry.remove_fallback(HANDLER_ID)?;
            info!("removed {HANDLER_ID} fallback");
        } else {
            warn!("shutdown called while not registered");
        }
        Ok(())
    }

    pub fn config(&self) -> &ChatConfig {
        self.conversation.config()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    /// See [`Conversation::cancel_handle`].
    pub fn cancel_handle(&self) -> CancellationToken {
        self.conversation.cancel_handle()
    }

    pub fn registered_priority(&self) -> Option<i32> {
        self.registered_priority
    }
}

fn build_detector(config: &ChatConfig) -> Result<Option<LanguageDetector>> {
    if !config.detection_enabled() {
        return Ok(None);
    }
    LanguageDetector::new(
        config.fasttext_url.trim(),
        Duration::from_secs(config.detect_timeout_secs),
    )
    .map(Some)
}
