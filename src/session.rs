//! Conversation session state.
//!
//! A [`Session`] holds the ordered message history sent to the model. The
//! preamble is always `history[0]`. Expiry is keyed off the time of the last
//! reset, not the last message.

use crate::config::ChatConfig;
use crate::llm::{ChatMessage, Role};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// The single active conversation of a handler.
#[derive(Debug, Clone)]
pub struct Session {
    history: Vec<ChatMessage>,
    preamble: String,
    last_activity: DateTime<Utc>,
    timeout: TimeDelta,
    /// Maximum retained messages after the preamble. 0 disables trimming.
    max_history_messages: usize,
}

impl Session {
    /// Create a session initialised from `config`, stamped at `now`.
    pub fn new(config: &ChatConfig, now: DateTime<Utc>) -> Self {
        let mut session = Self {
            history: Vec::new(),
            preamble: String::new(),
            last_activity: now,
            timeout: TimeDelta::zero(),
            max_history_messages: 0,
        };
        session.reset(config, now);
        session
    }

    /// Reload preamble and limits from `config` and discard all turns.
    pub fn reset(&mut self, config: &ChatConfig, now: DateTime<Utc>) {
        self.preamble = config.preamble.clone();
        self.timeout = i64::try_from(config.context_timeout_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        self.max_history_messages = config.max_history_messages;
        self.history.clear();
        self.history.push(ChatMessage::system(self.preamble.clone()));
        self.last_activity = now;
        debug!("session reset at {now}");
    }

    /// Append a turn. The sliding window is applied separately, between turns.
    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        let content = content.into();
        debug!(role = role.as_str(), "updated chat history: {content}");
        self.history.push(ChatMessage::new(role, content));
    }

    /// Whether more than the configured timeout has elapsed since the last reset.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity > self.timeout
    }

    /// Full history, preamble first.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn timeout(&self) -> TimeDelta {
        self.timeout
    }

    /// Number of turns after the preamble.
    pub fn turn_count(&self) -> usize {
        self.history.len().saturating_sub(1)
    }

    /// Drop the oldest exchanges until at most `max_history_messages` turns
    /// follow the preamble.
    ///
    /// An exchange is a user turn plus the assistant chunks after it, and is
    /// always dropped whole, so `history[1]` is never an orphaned reply.
    pub fn trim_to_window(&mut self) {
        let max = self.max_history_messages;
        if max == 0 {
            return;
        }
        let mut start = 1;
        while self.history.len() - start > max {
            start += 1;
            while start < self.history.len() && self.history[start].role != Role::User {
                start += 1;
            }
        }
        if start > 1 {
            self.history.drain(1..start);
            debug!("trimmed {} old turns from history", start - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn config(timeout: u64) -> ChatConfig {
        ChatConfig {
            preamble: "P".to_owned(),
            context_timeout_secs: timeout,
            max_history_messages: 0,
            ..Default::default()
        }
    }

    #[test]
    fn new_session_holds_only_preamble() {
        let session = Session::new(&config(600), t0());
        assert_eq!(session.history(), &[ChatMessage::system("P")]);
        assert_eq!(session.turn_count(), 0);
    }

    #[test]
    fn reset_always_yields_preamble_only() {
        let cfg = config(600);
        let mut session = Session::new(&cfg, t0());
        for i in 0..25 {
            session.append(Role::User, format!("q{i}"));
            session.append(Role::Assistant, format!("a{i}"));
        }
        assert_eq!(session.turn_count(), 50);

        session.reset(&cfg, t0());
        assert_eq!(session.history(), &[ChatMessage::system("P")]);
    }

    #[test]
    fn reset_picks_up_new_preamble_and_timeout() {
        let mut session = Session::new(&config(600), t0());
        session.append(Role::User, "hello");

        let updated = ChatConfig {
            preamble: "Q".to_owned(),
            context_timeout_secs: 30,
            ..config(30)
        };
        let later = t0() + TimeDelta::seconds(5);
        session.reset(&updated, later);

        assert_eq!(session.preamble(), "Q");
        assert_eq!(session.history()[0], ChatMessage::system("Q"));
        assert_eq!(session.timeout(), TimeDelta::seconds(30));
        assert_eq!(session.last_activity(), later);
    }

    #[test]
    fn expiry_boundary_is_not_expired() {
        let session = Session::new(&config(600), t0());
        assert!(!session.is_expired(t0()));
        assert!(!session.is_expired(t0() + TimeDelta::seconds(600)));
        assert!(session.is_expired(t0() + TimeDelta::seconds(601)));
    }

    #[test]
    fn expiry_counts_whole_days() {
        let session = Session::new(&config(600), t0());
        assert!(session.is_expired(t0() + TimeDelta::days(1) + TimeDelta::seconds(1)));
    }

    #[test]
    fn append_does_not_refresh_activity() {
        let mut session = Session::new(&config(10), t0());
        session.append(Role::User, "hi");
        assert_eq!(session.last_activity(), t0());
        assert!(session.is_expired(t0() + TimeDelta::seconds(11)));
    }

    #[test]
    fn sliding_window_keeps_preamble_and_newest_turns() {
        let cfg = ChatConfig {
            max_history_messages: 3,
            ..config(600)
        };
        let mut session = Session::new(&cfg, t0());
        for i in 0..5 {
            session.append(Role::User, format!("m{i}"));
        }
        session.trim_to_window();

        let contents: Vec<&str> = session
            .history()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["P", "m2", "m3", "m4"]);
        assert_eq!(session.history()[0].role, Role::System);
    }

    #[test]
    fn append_never_trims() {
        let cfg = ChatConfig {
            max_history_messages: 2,
            ..config(600)
        };
        let mut session = Session::new(&cfg, t0());
        session.append(Role::User, "q");
        for i in 0..5 {
            session.append(Role::Assistant, format!("a{i}"));
        }
        assert_eq!(session.turn_count(), 6);
        assert_eq!(session.history()[1], ChatMessage::user("q"));
    }

    #[test]
    fn window_drops_whole_exchanges() {
        let cfg = ChatConfig {
            max_history_messages: 3,
            ..config(600)
        };
        let mut session = Session::new(&cfg, t0());
        session.append(Role::User, "q0");
        session.append(Role::Assistant, "a0.");
        session.append(Role::Assistant, " a0b.");
        session.append(Role::User, "q1");
        session.append(Role::Assistant, "a1.");
        session.trim_to_window();

        assert_eq!(
            session.history(),
            &[
                ChatMessage::system("P"),
                ChatMessage::user("q1"),
                ChatMessage::assistant("a1."),
            ]
        );
    }

    #[test]
    fn exchange_larger_than_window_is_dropped_whole() {
        let cfg = ChatConfig {
            max_history_messages: 4,
            ..config(600)
        };
        let mut session = Session::new(&cfg, t0());
        session.append(Role::User, "q");
        for i in 0..5 {
            session.append(Role::Assistant, format!("a{i}"));
        }
        session.trim_to_window();
        assert_eq!(session.history(), &[ChatMessage::system("P")]);
    }

    #[test]
    fn zero_window_is_unbounded() {
        let mut session = Session::new(&config(600), t0());
        for i in 0..200 {
            session.append(Role::User, format!("m{i}"));
        }
        session.trim_to_window();
        assert_eq!(session.turn_count(), 200);
    }
}
