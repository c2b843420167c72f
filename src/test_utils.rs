//! In-memory fakes for the backend and host traits.
//!
//! Shared by unit tests and the `tests/` integration suite.

use crate::error::{ChatError, Result};
use crate::host::{FallbackRegistry, VoiceHost};
use crate::llm::{ChatBackend, ChatRequest, StreamEvent, StreamEventStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Scripted {
    Reply(Vec<Result<StreamEvent>>),
    /// Yields the events, then never ends.
    Hang(Vec<Result<StreamEvent>>),
    ConnectionError(String),
}

/// Backend that replays queued replies and records every request.
///
/// With an empty queue a call fails with a connection error.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next call.
    pub fn push_reply(&self, events: Vec<Result<StreamEvent>>) {
        lock(&self.script).push_back(Scripted::Reply(events));
    }

    /// Queue a reply made of plain tokens followed by an empty end marker.
    pub fn push_tokens(&self, tokens: &[&str]) {
        let mut events: Vec<Result<StreamEvent>> =
            tokens.iter().map(|t| Ok(StreamEvent::token(*t))).collect();
        events.push(Ok(StreamEvent::final_token("")));
        self.push_reply(events);
    }

    /// Queue a reply that stalls after `events` until the consumer gives up.
    pub fn push_hanging_reply(&self, events: Vec<Result<StreamEvent>>) {
        lock(&self.script).push_back(Scripted::Hang(events));
    }

    /// Make the next call fail before streaming.
    pub fn push_connection_error(&self, message: &str) {
        lock(&self.script).push_back(Scripted::ConnectionError(message.to_owned()));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<StreamEventStream> {
        lock(&self.requests).push(request.clone());
        let next = lock(&self.script).pop_front();
        match next {
            Some(Scripted::Reply(events)) => Ok(stream::iter(events).boxed()),
            Some(Scripted::Hang(events)) => {
                Ok(stream::iter(events).chain(stream::pending()).boxed())
            }
            Some(Scripted::ConnectionError(message)) => Err(ChatError::BackendConnection(message)),
            None => Err(ChatError::BackendConnection("no scripted reply".to_owned())),
        }
    }
}

/// Voice host that records what it was asked to say.
#[derive(Default)]
pub struct RecordingVoice {
    spoken: Mutex<Vec<(String, bool, bool)>>,
    dialogs: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingVoice {
    /// A host whose speech calls all fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(text, expect_response, wait)` for every `speak` call.
    pub fn spoken(&self) -> Vec<(String, bool, bool)> {
        lock(&self.spoken).clone()
    }

    /// Spoken texts only.
    pub fn texts(&self) -> Vec<String> {
        lock(&self.spoken).iter().map(|(t, _, _)| t.clone()).collect()
    }

    pub fn dialogs(&self) -> Vec<String> {
        lock(&self.dialogs).clone()
    }
}

#[async_trait]
impl VoiceHost for RecordingVoice {
    async fn speak(&self, text: &str, expect_response: bool, wait: bool) -> Result<()> {
        if self.fail {
            return Err(ChatError::Speech("audio device unavailable".to_owned()));
        }
        lock(&self.spoken).push((text.to_owned(), expect_response, wait));
        Ok(())
    }

    async fn speak_dialog(&self, name: &str) -> Result<()> {
        if self.fail {
            return Err(ChatError::Speech("audio device unavailable".to_owned()));
        }
        lock(&self.dialogs).push(name.to_owned());
        Ok(())
    }
}

/// A call made against [`RecordingRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register { handler: String, priority: i32 },
    Remove { handler: String },
}

/// Fallback registry that records registrations in order.
#[derive(Default)]
pub struct RecordingRegistry {
    calls: Mutex<Vec<RegistryCall>>,
    reject: bool,
}

impl RecordingRegistry {
    /// A registry that refuses every registration.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        lock(&self.calls).clone()
    }
}

impl FallbackRegistry for RecordingRegistry {
    fn register_fallback(&self, handler: &str, priority: i32) -> Result<()> {
        if self.reject {
            return Err(ChatError::Registration(format!(
                "{handler} rejected at priority {priority}"
            )));
        }
        lock(&self.calls).push(RegistryCall::Register {
            handler: handler.to_owned(),
            priority,
        });
        Ok(())
    }

    fn remove_fallback(&self, handler: &str) -> Result<()> {
        lock(&self.calls).push(RegistryCall::Remove {
            handler: handler.to_owned(),
        });
        Ok(())
    }
}
