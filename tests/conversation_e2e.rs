//! End-to-end conversation tests.
//!
//! The router is driven the way a voice-assistant host drives it. Most tests
//! use the scripted backend; the full-stack test talks to a mock Ollama server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use ollama_chat::host::LANG_KEY;
use ollama_chat::llm::{ChatBackend, ChatMessage, OllamaBackend, Role, StreamEvent};
use ollama_chat::test_utils::{RecordingRegistry, RecordingVoice, RegistryCall, ScriptedBackend};
use ollama_chat::{
    ChatConfig, FallbackRegistry, FallbackRouter, MessageContext, TurnOutcome, VoiceHost,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PREAMBLE: &str = "You are a zoologist.";

struct Harness {
    router: FallbackRouter,
    backend: Arc<ScriptedBackend>,
    voice: Arc<RecordingVoice>,
    registry: Arc<RecordingRegistry>,
}

fn config() -> ChatConfig {
    ChatConfig {
        preamble: PREAMBLE.to_owned(),
        ..Default::default()
    }
}

fn harness(config: ChatConfig) -> Harness {
    let backend = Arc::new(ScriptedBackend::new());
    let voice = Arc::new(RecordingVoice::default());
    let registry = Arc::new(RecordingRegistry::default());
    let mut router = FallbackRouter::new(
        config,
        Arc::clone(&backend) as Arc<dyn ChatBackend>,
        Arc::clone(&voice) as Arc<dyn VoiceHost>,
        Arc::clone(&registry) as Arc<dyn FallbackRegistry>,
    )
    .unwrap();
    router.initialize().unwrap();
    Harness {
        router,
        backend,
        voice,
        registry,
    }
}

const MAMMAL_REPLY: &[&str] = &[
    "The", " blue", " whale", " is", " the", " biggest", " mammal", " on", " earth", ".",
    " It", " can", " reach", " 30", " metres", "!", " Adults", " weigh", " up", " to", " 150",
    " tonnes",
];

#[tokio::test]
async fn mammal_question_builds_expected_history() {
    let mut h = harness(config());
    h.backend.push_tokens(MAMMAL_REPLY);

    let question = "What is the biggest mammal on earth?";
    assert!(h.router.handle_fallback(question).await);

    let history = h.router.conversation().session().history();
    assert_eq!(history[0], ChatMessage::system(PREAMBLE));
    assert_eq!(history[1], ChatMessage::user(question));

    let assistant: Vec<&ChatMessage> = history[2..].iter().collect();
    assert!(assistant.iter().all(|m| m.role == Role::Assistant));
    assert_eq!(
        assistant.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec![
            "The blue whale is the biggest mammal on earth.",
            " It can reach 30 metres!",
            " Adults weigh up to 150 tonnes",
        ]
    );
    let joined: String = assistant.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(joined, MAMMAL_REPLY.concat());

    // One speak call per assistant entry; only the last asks for a response.
    let spoken = h.voice.spoken();
    assert_eq!(spoken.len(), assistant.len());
    assert!(spoken[..spoken.len() - 1].iter().all(|(_, expect, _)| !expect));
    assert!(spoken.last().unwrap().1);
    assert!(spoken.iter().all(|(_, _, wait)| *wait));
}

#[tokio::test]
async fn mic_artifact_changes_nothing() {
    let mut h = harness(config());
    assert!(!h.router.handle_fallback("the").await);
    assert_eq!(
        h.router.conversation().session().history(),
        &[ChatMessage::system(PREAMBLE)]
    );
    assert_eq!(h.backend.call_count(), 0);
    assert!(h.voice.spoken().is_empty());
}

#[tokio::test]
async fn follow_up_turn_sees_previous_reply() {
    let mut h = harness(config());
    h.backend.push_tokens(&["Whales", "."]);
    h.backend.push_tokens(&["Krill", "."]);

    assert!(h.router.handle_fallback("Which animal is biggest?").await);
    assert!(h.router.handle_fallback("What does it eat?").await);

    let second = &h.backend.requests()[1];
    let contents: Vec<&str> = second.messages[1..]
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        contents,
        vec!["Which animal is biggest?", "Whales.", "What does it eat?"]
    );
}

#[tokio::test]
async fn connection_failure_is_silent_and_session_survives() {
    let mut h = harness(config());
    h.backend.push_connection_error("connection refused");
    h.backend.push_tokens(&["Back", "."]);

    assert!(!h.router.handle_fallback("hello?").await);
    assert!(h.voice.spoken().is_empty());

    assert!(h.router.handle_fallback("are you there?").await);
    let history = h.router.conversation().session().history();
    assert_eq!(
        history[1..],
        [
            ChatMessage::user("hello?"),
            ChatMessage::user("are you there?"),
            ChatMessage::assistant("Back."),
        ]
    );
}

#[tokio::test]
async fn cancelling_stops_a_stalled_generation() {
    let mut h = harness(config());
    h.backend.push_hanging_reply(vec![
        Ok(StreamEvent::token("Let")),
        Ok(StreamEvent::token(" me")),
        Ok(StreamEvent::token(" think")),
        Ok(StreamEvent::token(".")),
        Ok(StreamEvent::token(" Hmm")),
    ]);
    h.backend.push_tokens(&["Ready", "."]);

    let cancel = h.router.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        h.router.conversation_mut().handle_turn("think hard"),
    )
    .await
    .expect("cancellation should end the turn");
    // Speech had started, so the host must not reroute the utterance.
    assert_eq!(outcome, TurnOutcome::Interrupted);
    assert!(outcome.handled());

    // The phrase completed before cancellation was spoken and kept.
    assert_eq!(h.voice.texts(), vec!["Let me think.".to_owned()]);

    // The next turn runs normally with a fresh token.
    assert!(!h.router.cancel_handle().is_cancelled());
    assert!(h.router.handle_fallback("ready?").await);
    assert_eq!(h.voice.texts().last().unwrap(), "Ready.");
}

#[tokio::test]
async fn settings_change_resets_and_reregisters() {
    let mut h = harness(config());
    h.backend.push_tokens(&["Hi", "."]);
    h.router.handle_fallback("hello").await;

    h.router
        .on_settings_changed(ChatConfig {
            priority: 20,
            preamble: "You are a botanist.".to_owned(),
            model: "llama3".to_owned(),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(
        h.registry.calls(),
        vec![
            RegistryCall::Register {
                handler: "ollama-chat".to_owned(),
                priority: 90
            },
            RegistryCall::Remove {
                handler: "ollama-chat".to_owned()
            },
            RegistryCall::Register {
                handler: "ollama-chat".to_owned(),
                priority: 20
            },
        ]
    );
    assert_eq!(
        h.router.conversation().session().history(),
        &[ChatMessage::system("You are a botanist.")]
    );

    h.backend.push_tokens(&["Ferns", "."]);
    h.router.handle_fallback("name a plant").await;
    assert_eq!(h.backend.requests().last().unwrap().model, "llama3");
}

#[tokio::test]
async fn thanks_is_acknowledged_without_the_model() {
    let mut h = harness(config());
    assert!(h.router.converse(Some("thank you")).await);
    assert_eq!(h.voice.dialogs(), vec!["noproblem".to_owned()]);
    assert_eq!(h.backend.call_count(), 0);
}

#[tokio::test]
async fn shutdown_leaves_the_chain() {
    let mut h = harness(config());
    h.router.shutdown().unwrap();
    assert_eq!(
        h.registry.calls().last().unwrap(),
        &RegistryCall::Remove {
            handler: "ollama-chat".to_owned()
        }
    );
}

#[tokio::test]
async fn utterance_is_tagged_with_detected_language() {
    let detector = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/language_detect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([["de", 0.97]])))
        .mount(&detector)
        .await;

    let h = harness(ChatConfig {
        fasttext_url: detector.uri(),
        handle_utterance: true,
        ..config()
    });

    let mut context = MessageContext::new();
    h.router
        .handle_utterance(&["wie groß ist ein wal".to_owned()], &mut context)
        .await;
    assert_eq!(context.get(LANG_KEY), Some(&json!("de")));
}

#[tokio::test]
async fn full_stack_against_mock_ollama() {
    let server = MockServer::start().await;
    let body: String = [
        json!({"message": {"role": "assistant", "content": "Blue"}, "done": false}),
        json!({"message": {"role": "assistant", "content": " whale"}, "done": false}),
        json!({"message": {"role": "assistant", "content": "."}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true}),
    ]
    .iter()
    .map(|l| format!("{l}\n"))
    .collect();

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let voice = Arc::new(RecordingVoice::default());
    let backend = OllamaBackend::new(server.uri(), Duration::from_secs(2)).unwrap();
    let mut router = FallbackRouter::new(
        config(),
        Arc::new(backend),
        Arc::clone(&voice) as Arc<dyn VoiceHost>,
        Arc::new(RecordingRegistry::default()),
    )
    .unwrap();

    assert!(router.handle_fallback("biggest animal?").await);
    assert_eq!(voice.spoken(), vec![("Blue whale.".to_owned(), true, true)]);
}

#[test]
fn config_file_drives_router_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "priority = 42\nmodel = \"mistral\"\ncontext_timeout = 30\npreamble = \"Be brief.\"\n",
    )
    .unwrap();

    let config = ChatConfig::from_file(&path).unwrap();
    let h = harness(config);
    assert_eq!(h.router.registered_priority(), Some(42));
    assert_eq!(h.router.config().model, "mistral");
    assert_eq!(h.router.conversation().session().preamble(), "Be brief.");
    assert_eq!(
        h.router.conversation().session().timeout(),
        chrono::TimeDelta::seconds(30)
    );
}
